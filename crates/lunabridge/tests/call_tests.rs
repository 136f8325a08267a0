//! Call Tests
//!
//! Tests for calls crossing the boundary in both directions:
//! - Host calling script functions (results, multiple returns, errors)
//! - Script calling host callables (argument order, results, errors, panics)
//! - Nested host -> script -> host -> script chains
//!
//! # Running Tests
//! ```bash
//! cargo test --test call_tests
//! ```

use std::cell::RefCell;
use std::rc::Rc;

use lunabridge::{BridgeError, HostFunction, LocalFunction, ReferenceKind, Session, Value};

const FIB: &str = r#"
function fib(n)
    if n < 2 then
        return n
    end
    return fib(n - 1) + fib(n - 2)
end
"#;

// ===== Host Calling Script =====

#[test]
fn test_fib() {
    let session = Session::new().unwrap();
    session.execute(FIB).unwrap();

    let fib = session.get_function("fib").unwrap();
    let results = fib.call(&[Value::from(7)]).unwrap();
    assert_eq!(results, vec![Value::Number(13.0)]);

    fib.release();
    assert_eq!(session.outstanding_allocations(), 0);
    session.close();
}

#[test]
fn test_multiple_returns() {
    let session = Session::new().unwrap();
    session
        .execute("function multiCall(n) return n * 3, 'testing', false end")
        .unwrap();

    let multi = session.get_function("multiCall").unwrap();
    let results = multi.call(&[Value::from(3)]).unwrap();
    assert_eq!(
        results,
        vec![Value::Number(9.0), Value::from("testing"), Value::Boolean(false)]
    );

    drop(results);
    drop(multi);
    assert_eq!(session.outstanding_allocations(), 0);
    session.close();
}

#[test]
fn test_nil_and_empty_returns() {
    let session = Session::new().unwrap();
    session
        .execute("function retNil() return nil end function retNothing() end")
        .unwrap();

    let ret_nil = session.get_function("retNil").unwrap();
    assert_eq!(ret_nil.call(&[]).unwrap(), vec![Value::Nil]);

    let ret_nothing = session.get_function("retNothing").unwrap();
    assert!(ret_nothing.call(&[]).unwrap().is_empty());

    drop((ret_nil, ret_nothing));
    assert_eq!(session.outstanding_allocations(), 0);
    session.close();
}

#[test]
fn test_arguments_keep_order_and_type() {
    let session = Session::new().unwrap();
    session
        .execute(
            r#"
            function describe(...)
                local out = {}
                for i = 1, select('#', ...) do
                    out[i] = type((select(i, ...)))
                end
                return table.concat(out, ',')
            end
            "#,
        )
        .unwrap();

    let describe = session.get_function("describe").unwrap();
    let results = describe
        .call(&[
            Value::from(1),
            Value::from("two"),
            Value::Nil,
            Value::Boolean(true),
            Value::function(|_| Ok(vec![])),
        ])
        .unwrap();
    assert_eq!(results, vec![Value::from("number,string,nil,boolean,function")]);

    drop(describe);
    session.execute("collectgarbage() collectgarbage()").unwrap();
    assert_eq!(session.pinned_handles(), 0);
    assert_eq!(session.outstanding_allocations(), 0);
    session.close();
}

#[test]
fn test_script_error_through_execute() {
    let session = Session::new().unwrap();
    let err = session.execute("error('some error')").unwrap_err();
    match err {
        BridgeError::ScriptError(message) => {
            assert!(message.ends_with("some error"), "{}", message)
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(session.outstanding_allocations(), 0);
    session.close();
}

#[test]
fn test_script_error_through_call() {
    let session = Session::new().unwrap();
    session.execute("function fails() error('some error') end").unwrap();

    let fails = session.get_function("fails").unwrap();
    let err = fails.call(&[Value::from("ignored")]).unwrap_err();
    assert!(matches!(err, BridgeError::ScriptError(ref m) if m.ends_with("some error")));

    drop(fails);
    assert_eq!(session.outstanding_allocations(), 0);
    session.close();
}

#[test]
fn test_error_with_non_string_value() {
    let session = Session::new().unwrap();
    let err = session.execute("error(42, 0)").unwrap_err();
    assert_eq!(err.to_string(), "42");
    let err = session.execute("error(nil)").unwrap_err();
    assert_eq!(err.to_string(), "(error object is a nil value)");
    session.close();
}

#[test]
fn test_syntax_error() {
    let session = Session::new().unwrap();
    let err = session.execute("function (").unwrap_err();
    assert!(matches!(err, BridgeError::ScriptError(_)));
    session.execute("ok = true").unwrap();
    session.close();
}

#[test]
fn test_calling_a_table_fails() {
    let session = Session::new().unwrap();
    session.execute("t = {}").unwrap();
    let table = session.get_global("t").unwrap();
    assert!(matches!(
        table.into_typed::<LocalFunction>(),
        Err(BridgeError::TypeMismatch { expected: "function", found: "table" })
    ));
    assert_eq!(session.outstanding_allocations(), 0);
    session.close();
}

// ===== Script Calling Host =====

#[test]
fn test_host_callable_arguments_and_results() {
    let session = Session::new().unwrap();
    let seen: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));

    let record = Rc::clone(&seen);
    session
        .register_callable("check", move |args| {
            let mut record = record.borrow_mut();
            for arg in &args {
                record.push(match arg {
                    Value::Number(n) => format!("number:{}", n),
                    Value::String(s) => format!("string:{}", s),
                    Value::Nil => "nil".to_string(),
                    Value::Reference(r) => format!("ref:{}", r.kind().name()),
                    other => format!("other:{}", other.type_name()),
                });
            }
            Ok(vec![
                Value::from("test"),
                Value::from(5),
                Value::Boolean(true),
                Value::function(|_| Ok(vec![Value::from("inner")])),
            ])
        })
        .unwrap();

    session
        .execute(
            r#"
            local a, b, c, d = check(5, "bleh", nil, {})
            assert(a == "test", "first")
            assert(b == 5, "second")
            assert(c == true, "third")
            assert(type(d) == "function", "fourth")
            assert(d() == "inner", "callable")
            returned = d
            "#,
        )
        .unwrap();

    assert_eq!(
        *seen.borrow(),
        vec!["number:5", "string:bleh", "nil", "ref:table"]
    );

    let returned = session.get_global("returned").unwrap();
    let reference = returned.as_reference().unwrap();
    assert_eq!(reference.kind(), ReferenceKind::Function);
    assert!(reference.is_host_function());
    assert!(returned.as_function().is_none());

    drop(returned);
    assert_eq!(session.outstanding_allocations(), 0);
    session.close();
}

#[test]
fn test_host_error_reaches_script_verbatim() {
    let session = Session::new().unwrap();
    session
        .register_callable("fails", |_| Err(BridgeError::host("WOW ERROR")))
        .unwrap();
    session.execute("function callFails() return fails(1, 2) end").unwrap();

    let call_fails = session.get_function("callFails").unwrap();
    let err = call_fails.call(&[]).unwrap_err();
    match err {
        BridgeError::ScriptError(message) => assert_eq!(message, "WOW ERROR"),
        other => panic!("unexpected error: {:?}", other),
    }

    session
        .execute("ok, msg, extra = pcall(fails) assert(not ok) assert(extra == nil)")
        .unwrap();
    assert_eq!(session.get_global("msg").unwrap(), Value::from("WOW ERROR"));

    drop(call_fails);
    assert_eq!(session.outstanding_allocations(), 0);
    session.close();
}

#[test]
fn test_host_panic_is_captured() {
    let session = Session::new().unwrap();
    session
        .register_callable("boom", |_| panic!("kaboom"))
        .unwrap();

    session.execute("ok, msg = pcall(boom, 'arg')").unwrap();
    assert_eq!(session.get_global("ok").unwrap(), Value::Boolean(false));
    assert_eq!(
        session.get_global("msg").unwrap(),
        Value::from("Host function panicked: kaboom")
    );

    session.execute("after = 1 + 1").unwrap();
    assert_eq!(session.get_global("after").unwrap(), Value::Number(2.0));
    assert_eq!(session.outstanding_allocations(), 0);
    session.close();
}

#[test]
fn test_host_function_value_can_be_passed_back() {
    let session = Session::new().unwrap();
    session
        .register_callable("echo", |args| Ok(args))
        .unwrap();

    let echo = session.get_global("echo").unwrap();
    assert!(echo.as_reference().unwrap().is_host_function());

    session.set_global("again", echo).unwrap();
    session
        .execute("local a, b = again(1, 'x') assert(a == 1 and b == 'x')")
        .unwrap();
    assert_eq!(session.outstanding_allocations(), 0);
    session.close();
}

#[test]
fn test_register_function_shares_callable() {
    let session = Session::new().unwrap();
    let calls = Rc::new(RefCell::new(0));
    let counter = Rc::clone(&calls);
    let function = HostFunction::new(move |_| {
        *counter.borrow_mut() += 1;
        Ok(vec![])
    });

    session.register_function("one", function.clone()).unwrap();
    session.register_function("two", function).unwrap();
    session.execute("one() two() one()").unwrap();
    assert_eq!(*calls.borrow(), 3);
    session.close();
}

#[test]
fn test_host_callable_inside_coroutine() {
    let session = Session::new().unwrap();
    session
        .register_callable("twice", |args| {
            let n = args.into_iter().next().unwrap_or(Value::Nil).into_typed::<f64>()?;
            Ok(vec![Value::from(n * 2.0)])
        })
        .unwrap();

    session
        .execute(
            r#"
            local co = coroutine.wrap(function(x)
                local y = twice(x)
                local z = twice(coroutine.yield(y))
                return z
            end)
            first = co(3)
            second = co(10)
            "#,
        )
        .unwrap();
    assert_eq!(session.get_global("first").unwrap(), Value::Number(6.0));
    assert_eq!(session.get_global("second").unwrap(), Value::Number(20.0));
    session.close();
}

#[test]
fn test_typed_argument_error_reaches_script() {
    let session = Session::new().unwrap();
    session
        .register_callable("wants_number", |args| {
            let n = args.into_iter().next().unwrap_or(Value::Nil).into_typed::<f64>()?;
            Ok(vec![Value::from(n)])
        })
        .unwrap();

    session.execute("ok, msg = pcall(wants_number, 'nope')").unwrap();
    assert_eq!(
        session.get_global("msg").unwrap(),
        Value::from("Type mismatch: expected number, got string")
    );
    session.close();
}

// ===== Re-entrant Chains =====

#[test]
fn test_nested_host_script_chain() {
    let session = Session::new().unwrap();
    session
        .register_callable("apply", |args| {
            let mut args = args.into_iter();
            let function = args.next().unwrap_or(Value::Nil).into_typed::<LocalFunction>()?;
            let rest: Vec<Value> = args.collect();
            function.call(&rest)
        })
        .unwrap();

    session
        .execute(
            r#"
            function outer(x)
                return apply(function(y)
                    return apply(function(z) return z * 2 end, y) + 1
                end, x)
            end
            "#,
        )
        .unwrap();

    let outer = session.get_function("outer").unwrap();
    assert_eq!(outer.call(&[Value::from(20)]).unwrap(), vec![Value::Number(41.0)]);

    drop(outer);
    assert_eq!(session.outstanding_allocations(), 0);
    session.close();
}

#[test]
fn test_error_unwinds_nested_chain() {
    let session = Session::new().unwrap();
    session
        .register_callable("apply", |args| {
            let function = args.into_iter().next().unwrap_or(Value::Nil);
            function.into_typed::<LocalFunction>()?.call(&[])
        })
        .unwrap();
    session
        .execute("function deep() return apply(function() error('bottom', 0) end) end")
        .unwrap();

    let deep = session.get_function("deep").unwrap();
    let err = deep.call(&[]).unwrap_err();
    assert!(matches!(err, BridgeError::ScriptError(ref m) if m == "bottom"));

    drop(deep);
    assert_eq!(session.outstanding_allocations(), 0);
    session.close();
}

#[test]
fn test_recursion_across_boundary() {
    let session = Session::new().unwrap();
    session
        .register_callable("down", |args| {
            let mut args = args.into_iter();
            let n = args.next().unwrap_or(Value::Nil).into_typed::<f64>()?;
            let step = args.next().unwrap_or(Value::Nil).into_typed::<LocalFunction>()?;
            if n <= 0.0 {
                return Ok(vec![Value::from(0)]);
            }
            let again = Value::Function(step.clone_ref()?);
            let results = step.call(&[Value::from(n - 1.0), again])?;
            let inner = results.into_iter().next().unwrap_or(Value::Nil);
            let inner = inner.into_typed::<f64>()?;
            Ok(vec![Value::from(inner + 1.0)])
        })
        .unwrap();
    session
        .execute("function step(n, self) return down(n, self) end")
        .unwrap();

    let step = session.get_function("step").unwrap();
    let copy = step.clone_ref().unwrap();
    let results = step.call(&[Value::from(10), Value::Function(copy)]).unwrap();
    assert_eq!(results, vec![Value::Number(10.0)]);

    drop(step);
    assert_eq!(session.outstanding_allocations(), 0);
    session.close();
}
