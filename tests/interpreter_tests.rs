// Integration tests for the J* interpreter.
//
// These run complete .jsr-style source strings through the real pipeline
// (lexer -> parser -> compiler -> VM) and inspect either the resulting
// module globals or the error the VM produced. Coverage spans the
// language surface spec.md describes: expressions and operators, control
// flow, functions and closures, classes and `super`, exceptions, the
// collection types, and the module/import system.

use ruff::value::{ObjKind, Value};
use ruff::vm::{RunError, Vm};

/// Runs `src` as a fresh top-level module named "test", returning the VM
/// (so heap-backed values can still be stringified) and the outcome.
fn run(src: &str) -> (Vm, Result<Value, RunError>) {
    let mut vm = Vm::new();
    let result = vm.run_source("<test>", src, "test");
    (vm, result)
}

fn module_global(vm: &Vm, module: &str, name: &str) -> Value {
    let module_ref = *vm.modules.get(module).unwrap_or_else(|| panic!("module '{module}' was never loaded"));
    match &vm.heap.get(module_ref).kind {
        ObjKind::Module(m) => *m.globals.get(name).unwrap_or(&Value::Null),
        _ => panic!("'{module}' is not a module object"),
    }
}

/// Runs `src`, expects success, and returns the stringified value of the
/// top-level global `name` (conventionally `result`).
fn eval_global(src: &str, name: &str) -> String {
    let (mut vm, outcome) = run(src);
    match outcome {
        Ok(_) => {
            let v = module_global(&vm, "test", name);
            vm.stringify(v)
        }
        Err(RunError::Runtime { message, trace }) => {
            panic!("expected success, got uncaught exception: {message}\n{}", trace.join("\n"))
        }
        Err(RunError::Compile(errs)) => panic!("expected success, got compile errors: {errs:?}"),
        Err(RunError::Syntax(errs)) => panic!("expected success, got syntax errors: {errs:?}"),
    }
}

/// Runs `src` and expects it to fail with an uncaught runtime exception,
/// returning the exception's stringified message.
fn expect_runtime_error(src: &str) -> String {
    let (_vm, outcome) = run(src);
    match outcome {
        Err(RunError::Runtime { message, .. }) => message,
        Ok(_) => panic!("expected a runtime error, but the script ran to completion"),
        Err(RunError::Compile(errs)) => panic!("expected a runtime error, got compile errors: {errs:?}"),
        Err(RunError::Syntax(errs)) => panic!("expected a runtime error, got syntax errors: {errs:?}"),
    }
}

fn expect_compile_error(src: &str) {
    let (_vm, outcome) = run(src);
    assert!(matches!(outcome, Err(RunError::Compile(_))), "expected a compile error");
}

fn expect_syntax_error(src: &str) {
    let (_vm, outcome) = run(src);
    assert!(matches!(outcome, Err(RunError::Syntax(_))), "expected a syntax error");
}

// ---------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------

#[test]
fn lexer_tokenizes_keywords_numbers_and_operators() {
    use ruff::lexer::{tokenize, Keyword, TokenKind};
    let tokens = tokenize("var x = 1.5 + 2 >= 3 != false");
    let kinds: Vec<&TokenKind> = tokens.iter().map(|t| &t.kind).collect();
    assert_eq!(kinds[0], &TokenKind::Keyword(Keyword::Var));
    assert!(matches!(kinds[1], TokenKind::Identifier(s) if s == "x"));
    assert_eq!(kinds[2], &TokenKind::Assign);
    assert!(matches!(kinds[3], TokenKind::Number(n) if (*n - 1.5).abs() < 1e-9));
    assert_eq!(kinds[4], &TokenKind::Plus);
    assert!(matches!(kinds[5], TokenKind::Number(n) if *n == 2.0));
    assert_eq!(kinds[6], &TokenKind::Ge);
    assert!(matches!(kinds[7], TokenKind::Number(n) if *n == 3.0));
    assert_eq!(kinds[8], &TokenKind::NotEq);
    assert_eq!(kinds[9], &TokenKind::Keyword(Keyword::False));
}

#[test]
fn lexer_flags_unterminated_string() {
    use ruff::lexer::{tokenize, TokenKind};
    let tokens = tokenize("\"abc");
    assert!(tokens.iter().any(|t| t.kind == TokenKind::UnterminatedString));
}

#[test]
fn lexer_handles_hex_and_exponent_numbers() {
    use ruff::lexer::{tokenize, TokenKind};
    let tokens = tokenize("0x1F 1e3 2.5e-2");
    let nums: Vec<f64> = tokens
        .iter()
        .filter_map(|t| if let TokenKind::Number(n) = t.kind { Some(n) } else { None })
        .collect();
    assert_eq!(nums, vec![31.0, 1000.0, 0.025]);
}

// ---------------------------------------------------------------------
// Arithmetic, comparisons, and string/unary operators
// ---------------------------------------------------------------------

#[test]
fn arithmetic_operator_precedence() {
    assert_eq!(eval_global("var result = 2 + 3 * 4 - 1", "result"), "13");
    assert_eq!(eval_global("var result = (2 + 3) * 4", "result"), "20");
    assert_eq!(eval_global("var result = 2 ^ 10", "result"), "1024");
    assert_eq!(eval_global("var result = 7 % 3", "result"), "1");
}

#[test]
fn integer_looking_floats_print_without_a_decimal_point() {
    assert_eq!(eval_global("var result = 10 / 2", "result"), "5");
    assert_eq!(eval_global("var result = 10 / 4", "result"), "2.5");
}

#[test]
fn comparisons_and_boolean_logic() {
    assert_eq!(eval_global("var result = 1 < 2 and 3 >= 3", "result"), "true");
    assert_eq!(eval_global("var result = 1 > 2 or 3 == 3", "result"), "true");
    assert_eq!(eval_global("var result = not (1 == 1)", "result"), "false");
}

#[test]
fn short_circuit_and_or_skip_the_right_operand() {
    let src = r#"
        var calls = 0
        fun sideeffect()
            calls = calls + 1
            return true
        end
        var result = false and sideeffect()
    "#;
    assert_eq!(eval_global(src, "calls"), "0");
    assert_eq!(eval_global(src, "result"), "false");

    let src2 = r#"
        var calls = 0
        fun sideeffect()
            calls = calls + 1
            return true
        end
        var result = true or sideeffect()
    "#;
    assert_eq!(eval_global(src2, "calls"), "0");
}

#[test]
fn string_concatenation_and_length_and_stringify_operators() {
    assert_eq!(eval_global(r#"var result = "foo" + "bar""#, "result"), "foobar");
    assert_eq!(eval_global(r#"var result = #"hello""#, "result"), "5");
    assert_eq!(eval_global("var result = ##42", "result"), "42");
    assert_eq!(eval_global("var result = ##null", "result"), "null");
}

#[test]
fn ternary_expression() {
    assert_eq!(eval_global(r#"var result = "yes" if 1 < 2 else "no""#, "result"), "yes");
    assert_eq!(eval_global(r#"var result = "yes" if 1 > 2 else "no""#, "result"), "no");
}

#[test]
fn adding_incompatible_types_raises_a_type_exception() {
    let message = expect_runtime_error(r#"var result = 1 + "x""#);
    assert!(message.to_lowercase().contains("type") || message.to_lowercase().contains("operand"), "{message}");
}

// ---------------------------------------------------------------------
// Variables, scoping, and compound/tuple assignment
// ---------------------------------------------------------------------

#[test]
fn block_scoped_locals_do_not_leak() {
    let src = r#"
        var x = 1
        begin
            var x = 2
        end
        var result = x
    "#;
    assert_eq!(eval_global(src, "result"), "1");
}

#[test]
fn compound_assignment_on_a_plain_variable() {
    let src = r#"
        var x = 10
        x += 5
        x -= 2
        x *= 3
        x /= 2
        var result = x
    "#;
    assert_eq!(eval_global(src, "result"), "19.5");
}

#[test]
fn compound_assignment_on_a_field_reads_and_writes_the_same_slot() {
    // Regression test: load_lvalue_for_compound must not leave stray
    // operands on the stack or feed GetIndex the wrong operand order.
    let src = r#"
        class Counter
            fun init()
                this.n = 10
            end
        end
        var c = Counter()
        c.n += 5
        c.n *= 2
        var result = c.n
    "#;
    assert_eq!(eval_global(src, "result"), "30");
}

#[test]
fn compound_assignment_on_an_index_reads_and_writes_the_same_slot() {
    let src = r#"
        var list = [1, 2, 3]
        list[1] += 10
        list[1] *= 2
        var result = list
    "#;
    assert_eq!(eval_global(src, "result"), "[1, 24, 3]");
}

#[test]
fn compound_assignment_evaluates_the_rhs_exactly_once() {
    let src = r#"
        var calls = 0
        fun five()
            calls = calls + 1
            return 5
        end
        var x = 1
        x += five()
        var result = calls
    "#;
    assert_eq!(eval_global(src, "result"), "1");
}

#[test]
fn tuple_unpacking_in_var_decl_and_plain_assignment() {
    let src = r#"
        var a, b = 1, 2
        a, b = b, a
        var result = (a, b)
    "#;
    assert_eq!(eval_global(src, "result"), "(2, 1)");
}

// ---------------------------------------------------------------------
// Control flow
// ---------------------------------------------------------------------

#[test]
fn if_elif_else_chain() {
    let src = r#"
        fun classify(n)
            if n < 0 then
                return "neg"
            elif n == 0 then
                return "zero"
            else
                return "pos"
            end
        end
        var result = classify(-1) + classify(0) + classify(1)
    "#;
    assert_eq!(eval_global(src, "result"), "negzeropos");
}

#[test]
fn while_loop_with_break_and_continue() {
    let src = r#"
        var i = 0
        var sum = 0
        while i < 10 do
            i = i + 1
            if i == 3 then
                continue
            end
            if i == 8 then
                break
            end
            sum = sum + i
        end
        var result = sum
    "#;
    // 1+2+4+5+6+7 (3 skipped, loop stops before adding 8)
    assert_eq!(eval_global(src, "result"), "25");
}

#[test]
fn classic_c_style_for_loop() {
    let src = r#"
        var sum = 0
        for var i = 0; i < 5; i = i + 1 do
            sum = sum + i
        end
        var result = sum
    "#;
    assert_eq!(eval_global(src, "result"), "10");
}

#[test]
fn foreach_over_a_list() {
    let src = r#"
        var total = 0
        for var x in [10, 20, 30] do
            total = total + x
        end
        var result = total
    "#;
    assert_eq!(eval_global(src, "result"), "60");
}

#[test]
fn foreach_over_a_string_iterates_characters() {
    let src = r#"
        var out = ""
        for var c in "abc" do
            out = out + c + "-"
        end
        var result = out
    "#;
    assert_eq!(eval_global(src, "result"), "a-b-c-");
}

#[test]
fn bare_begin_end_block_is_a_statement() {
    let src = r#"
        var result = 0
        begin
            result = 1 + 1
        end
    "#;
    assert_eq!(eval_global(src, "result"), "2");
}

// ---------------------------------------------------------------------
// Functions and closures
// ---------------------------------------------------------------------

#[test]
fn recursive_function_computes_factorial() {
    let src = r#"
        fun fact(n)
            if n <= 1 then
                return 1
            end
            return n * fact(n - 1)
        end
        var result = fact(6)
    "#;
    assert_eq!(eval_global(src, "result"), "720");
}

#[test]
fn default_parameters_fill_in_missing_arguments() {
    let src = r#"
        fun greet(name, greeting = "hello")
            return greeting + ", " + name
        end
        var result = greet("J*") + " | " + greet("world", "hi")
    "#;
    assert_eq!(eval_global(src, "result"), "hello, J* | hi, world");
}

#[test]
fn vararg_marker_packs_trailing_arguments_into_the_implicit_args_tuple() {
    let src = r#"
        fun sum(...)
            var total = 0
            for var a in args do
                total = total + a
            end
            return total
        end
        var result = sum(1, 2, 3, 4)
    "#;
    assert_eq!(eval_global(src, "result"), "10");
}

#[test]
fn vararg_marker_after_fixed_and_defaulted_parameters() {
    let src = r#"
        fun describe(first, second = "b", ...)
            return (first, second, #args)
        end
        var result = describe(1, 2, 3, 4, 5)
    "#;
    assert_eq!(eval_global(src, "result"), "(1, 2, 3)");
}

#[test]
fn closures_capture_and_share_an_upvalue() {
    let src = r#"
        fun make_counter()
            var n = 0
            fun inc()
                n = n + 1
                return n
            end
            return inc
        end
        var counter = make_counter()
        counter()
        counter()
        var result = counter()
    "#;
    assert_eq!(eval_global(src, "result"), "3");
}

#[test]
fn independent_closures_do_not_share_state() {
    let src = r#"
        fun make_counter()
            var n = 0
            fun inc()
                n = n + 1
                return n
            end
            return inc
        end
        var a = make_counter()
        var b = make_counter()
        a()
        a()
        var result = (a(), b())
    "#;
    assert_eq!(eval_global(src, "result"), "(3, 1)");
}

#[test]
fn anonymous_function_literal_as_a_value() {
    let src = r#"
        var square = fun(x) return x * x end
        var result = square(9)
    "#;
    assert_eq!(eval_global(src, "result"), "81");
}

#[test]
fn undefined_variable_error_suggests_a_close_global_name() {
    let message = expect_runtime_error(
        r#"
        var counter = 1
        print(counterr)
    "#,
    );
    assert!(message.contains("undefined variable 'counterr'"), "{message}");
    assert!(message.contains("did you mean 'counter'"), "{message}");
}

#[test]
fn missing_field_error_suggests_a_close_field_name() {
    let message = expect_runtime_error(
        r#"
        class Point
            fun init(x, y)
                this.x = x
                this.y = y
            end
        end
        var p = Point(1, 2)
        print(p.xx)
    "#,
    );
    assert!(message.contains("has no field 'xx'"), "{message}");
    assert!(message.contains("did you mean 'x'"), "{message}");
}

#[test]
fn calling_with_too_few_arguments_raises() {
    let message = expect_runtime_error(
        r#"
        fun needs_two(a, b)
            return a + b
        end
        needs_two(1)
    "#,
    );
    assert!(!message.is_empty());
}

// ---------------------------------------------------------------------
// Classes, inheritance, and super
// ---------------------------------------------------------------------

#[test]
fn instance_fields_and_methods() {
    let src = r#"
        class Point
            fun init(x, y)
                this.x = x
                this.y = y
            end
            fun sum()
                return this.x + this.y
            end
        end
        var p = Point(3, 4)
        var result = p.sum()
    "#;
    assert_eq!(eval_global(src, "result"), "7");
}

#[test]
fn single_inheritance_with_super_dispatch() {
    let src = r#"
        class Animal
            fun init(name)
                this.name = name
            end
            fun speak()
                return this.name + " makes a sound"
            end
        end
        class Dog is Animal
            fun speak()
                return super.speak() + ", specifically a bark"
            end
        end
        var d = Dog("Rex")
        var result = d.speak()
    "#;
    assert_eq!(eval_global(src, "result"), "Rex makes a sound, specifically a bark");
}

#[test]
fn super_dispatch_uses_the_statically_enclosing_class_not_the_receivers_class() {
    // Grandchild overrides speak() again; Dog's super.speak() must still
    // reach Animal's speak(), not Dog's own (which would recurse).
    let src = r#"
        class Animal
            fun speak()
                return "animal"
            end
        end
        class Dog is Animal
            fun speak()
                return "dog-" + super.speak()
            end
        end
        class Puppy is Dog
            fun speak()
                return "puppy-" + super.speak()
            end
        end
        var result = Puppy().speak()
    "#;
    assert_eq!(eval_global(src, "result"), "puppy-dog-animal");
}

#[test]
fn methods_are_late_bound_through_the_instances_dynamic_class() {
    let src = r#"
        class Shape
            fun describe()
                return "a " + this.name()
            end
            fun name()
                return "shape"
            end
        end
        class Circle is Shape
            fun name()
                return "circle"
            end
        end
        var result = Circle().describe()
    "#;
    assert_eq!(eval_global(src, "result"), "a circle");
}

// ---------------------------------------------------------------------
// Exceptions: try/except/ensure, raise, custom hierarchies
// ---------------------------------------------------------------------

#[test]
fn try_except_catches_a_raised_exception() {
    let src = r#"
        var result = "unset"
        try
            raise Exception("boom")
        except Exception e
            result = "caught: " + e.err()
        end
    "#;
    assert_eq!(eval_global(src, "result"), "caught: boom");
}

#[test]
fn ensure_runs_on_both_the_success_and_exception_paths() {
    let src = r#"
        var log = ""
        try
            log = log + "body;"
        ensure
            log = log + "ensure;"
        end
        var result = log
    "#;
    assert_eq!(eval_global(src, "result"), "body;ensure;");

    let src2 = r#"
        var log = ""
        try
            raise Exception("x")
        except Exception e
            log = log + "except;"
        ensure
            log = log + "ensure;"
        end
        var result = log
    "#;
    assert_eq!(eval_global(src2, "result"), "except;ensure;");
}

#[test]
fn ensure_runs_even_when_no_except_arm_matches_and_reraises() {
    let message = expect_runtime_error(
        r#"
        try
            raise Exception("unhandled")
        ensure
            print("cleanup")
        end
    "#,
    );
    assert_eq!(message, "unhandled");
}

#[test]
fn custom_exception_subclass_is_still_caught_via_its_base_class() {
    let src = r#"
        class MyError is Exception
        end
        var result = "unset"
        try
            raise MyError("custom")
        except Exception e
            result = e.err()
        end
    "#;
    assert_eq!(eval_global(src, "result"), "custom");
}

#[test]
fn mismatched_except_arm_lets_the_exception_propagate() {
    let message = expect_runtime_error(
        r#"
        class ErrorA is Exception
        end
        class ErrorB is Exception
        end
        try
            raise ErrorA("a")
        except ErrorB e
            print("should not run")
        end
    "#,
    );
    assert_eq!(message, "a");
}

// ---------------------------------------------------------------------
// Collections: lists, tuples, tables
// ---------------------------------------------------------------------

#[test]
fn list_indexing_and_negative_index_wraparound() {
    let src = r#"
        var list = [10, 20, 30]
        var result = (list[0], list[-1], #list)
    "#;
    assert_eq!(eval_global(src, "result"), "(10, 30, 3)");
}

#[test]
fn list_index_assignment() {
    let src = r#"
        var list = [1, 2, 3]
        list[0] = 99
        var result = list
    "#;
    assert_eq!(eval_global(src, "result"), "[99, 2, 3]");
}

#[test]
fn out_of_bounds_index_raises() {
    let message = expect_runtime_error("var list = [1, 2, 3]; list[10]");
    assert!(!message.is_empty());
}

#[test]
fn list_and_tuple_concatenation_with_plus() {
    assert_eq!(eval_global("var result = [1, 2] + [3]", "result"), "[1, 2, 3]");
    assert_eq!(eval_global("var result = (1, 2) + (3, 4)", "result"), "(1, 2, 3, 4)");
}

#[test]
fn table_literal_lookup_and_length() {
    let src = r#"
        var t = {"a": 1, "b": 2}
        var result = (t["a"], t["b"], #t)
    "#;
    assert_eq!(eval_global(src, "result"), "(1, 2, 2)");
}

#[test]
fn table_index_assignment_inserts_and_updates() {
    let src = r#"
        var t = {"a": 1}
        t["a"] = 10
        t["b"] = 20
        var result = (t["a"], t["b"], #t)
    "#;
    assert_eq!(eval_global(src, "result"), "(10, 20, 2)");
}

#[test]
fn table_contains_reports_key_presence() {
    let src = r#"
        var t = {}
        t["k"] = 1
        t["k"] = 2
        var result = (t["k"], #t, t.contains("k"), t.contains("missing"))
    "#;
    assert_eq!(eval_global(src, "result"), "(2, 1, true, false)");
}

// ---------------------------------------------------------------------
// Modules and natives
// ---------------------------------------------------------------------

#[test]
fn importing_math_exposes_its_native_functions() {
    let src = r#"
        import math
        var result = (math.sqrt(16), math.abs(-5), math.max(3, 7), math.min(3, 7))
    "#;
    assert_eq!(eval_global(src, "result"), "(4, 5, 7, 3)");
}

#[test]
fn set_sys_argv_exposes_the_cli_driver_arguments() {
    let mut vm = Vm::new();
    vm.set_sys_argv(&["script.jsr".to_string(), "a".to_string(), "b".to_string()]);
    let src = r#"
        import sys
        var result = (#sys.argv, sys.argv[0], sys.argv[1], sys.argv[2])
    "#;
    let result = vm.run_source("<test>", src, "test");
    assert!(result.is_ok(), "{result:?}");
    assert_eq!(vm.stringify(module_global(&vm, "test", "result")), "(3, script.jsr, a, b)");
}

#[test]
fn import_as_binds_the_chosen_alias_instead_of_the_leaf_name() {
    let src = r#"
        import math as m
        var result = m.floor(3.7)
    "#;
    assert_eq!(eval_global(src, "result"), "3");
}

#[test]
fn importing_an_unknown_builtin_like_module_name_raises_import_exception() {
    let message = expect_runtime_error("import not_a_real_module");
    assert!(message.to_lowercase().contains("import") || message.to_lowercase().contains("module"), "{message}");
}

#[test]
fn print_and_assert_natives_are_registered() {
    // assert(false, ...) should raise; assert(true, ...) should not.
    let ok = run(r#"assert(true, "should not fire")"#).1;
    assert!(ok.is_ok());
    let message = expect_runtime_error(r#"assert(false, "boom")"#);
    assert!(message.contains("boom"));
}

// ---------------------------------------------------------------------
// with statement (resource cleanup sugar over try/ensure)
// ---------------------------------------------------------------------

#[test]
fn with_statement_closes_the_resource_on_the_normal_exit_path() {
    let src = r#"
        class Resource
            fun init()
                this.closed = false
            end
            fun close()
                this.closed = true
            end
        end
        var tracker = Resource()
        with tracker res
            res.n = 1
        end
        var result = tracker.closed
    "#;
    assert_eq!(eval_global(src, "result"), "true");
}

#[test]
fn with_statement_closes_the_resource_even_when_the_body_raises() {
    let src = r#"
        class Resource
            fun init()
                this.closed = false
            end
            fun close()
                this.closed = true
            end
        end
        var tracker = Resource()
        var result = "unset"
        try
            with tracker res
                raise Exception("boom")
            end
        except Exception e
            result = tracker.closed
        end
    "#;
    assert_eq!(eval_global(src, "result"), "true");
}

// ---------------------------------------------------------------------
// Parse/compile error surfacing
// ---------------------------------------------------------------------

#[test]
fn unterminated_string_is_a_syntax_error() {
    expect_syntax_error("var x = \"abc");
}

#[test]
fn missing_end_keyword_is_a_syntax_error() {
    expect_syntax_error("if true then\n  var x = 1\n");
}

#[test]
fn try_with_neither_except_nor_ensure_is_a_syntax_error() {
    expect_syntax_error("try\n  var x = 1\nend");
}

#[test]
fn compound_assignment_onto_a_tuple_literal_is_rejected_by_the_parser() {
    // Tuple lvalues are only legal as `var`/plain-assignment targets, not
    // as compound-assignment targets.
    expect_syntax_error("var a = 1; var b = 2; (a, b) += 1");
}

#[test]
fn break_outside_a_loop_is_a_compile_error() {
    expect_compile_error("break");
}

#[test]
fn continue_outside_a_loop_is_a_compile_error() {
    expect_compile_error("continue");
}
