//! End-to-end interception tests.
//!
//! Each test rewrites the demo module, registers rules on a fresh [`Interception`] and runs
//! the rewritten code on the execution host.

mod common;

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Barrier, Mutex,
    },
    thread,
};

use common::{console_machine, demo_module, run_c};
use dotshim::{
    emulation::{EmValue, HeapObject},
    interception::{
        CallMap, CallProvider, Delegate, ExternalCallMocker, FnSubstitute, IntoDelegate,
        Interception, PopulateRequest, Replace,
    },
    metadata::{module::MethodCatalog, typesig::TypeSig},
    prelude::*,
};

fn rewritten() -> Result<Module> {
    let mut module = demo_module()?;
    let options = RewriteOptions::default();
    rewrite_module(&mut module, &mut CallSiteRewriter::new(options.clone()), &options)?;
    Ok(module)
}

#[test]
fn rewritten_code_without_rules_behaves_like_the_original() -> Result<()> {
    let original = Arc::new(demo_module()?);
    let (mut machine, printed) = console_machine(original, Arc::new(Interception::new()));
    let expected = run_c(&mut machine, "Do")?;
    let expected_describe = run_c(&mut machine, "Describe")?;
    let expected_person = run_c(&mut machine, "MakePerson")?;

    let interception = Arc::new(Interception::new());
    let (mut machine, rewritten_printed) = console_machine(Arc::new(rewritten()?), interception.clone());
    assert_eq!(run_c(&mut machine, "Do")?, expected);
    assert_eq!(run_c(&mut machine, "Describe")?, expected_describe);
    assert_eq!(run_c(&mut machine, "MakePerson")?, expected_person);
    assert_eq!(run_c(&mut machine, "UseGeneric")?, EmValue::I32(7));

    assert_eq!(expected, EmValue::I32(5));
    assert_eq!(*printed.lock().unwrap(), vec!["hello".to_string()]);
    assert_eq!(*rewritten_printed.lock().unwrap(), vec!["hello".to_string()]);
    // Without any provider no call map is ever built.
    assert!(interception.maps().is_empty());
    Ok(())
}

#[test]
fn substitute_runs_instead_of_the_original() -> Result<()> {
    let module = rewritten()?;
    let interception = Arc::new(Interception::new());
    Replace::method(&module, "Demo.Util", "Helper", &[TypeSig::String])?
        .with(&interception, |text: String| text.len() as i32 * 10)?;

    let (mut machine, printed) = console_machine(Arc::new(module), interception.clone());
    assert_eq!(run_c(&mut machine, "Do")?, EmValue::I32(50));
    assert!(printed.lock().unwrap().is_empty());
    assert_eq!(interception.maps().len(), 1);
    Ok(())
}

#[test]
fn substitute_sees_the_invocation_context() -> Result<()> {
    let module = rewritten()?;
    let helper = module
        .methods_of("Demo.Util")
        .into_iter()
        .find(|method| method.name == "Helper")
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let interception = Arc::new(Interception::new());
    Replace::exact(helper).with_substitute(
        &interception,
        Arc::new(FnSubstitute::new(move |context| {
            assert!(!context.calling_instance().is_null());
            assert!(context.target().is_null());
            assert!(!context.stack_trace().is_empty());
            sink.lock().unwrap().push(format!(
                "{} -> {} {:?}",
                context.calling_method().full_name(),
                context.target_method().full_name(),
                context.arguments()[0].as_str()
            ));
            Ok(EmValue::I32(1))
        })),
    )?;

    let (mut machine, _) = console_machine(Arc::new(module), interception);
    assert_eq!(run_c(&mut machine, "Do")?, EmValue::I32(1));
    assert_eq!(
        *seen.lock().unwrap(),
        vec!["Demo.C::Do -> Demo.Util::Helper Some(\"hello\")".to_string()]
    );
    Ok(())
}

#[test]
fn overloads_are_told_apart() -> Result<()> {
    let module = rewritten()?;
    let interception = Arc::new(Interception::new());
    Replace::method(&module, "Demo.Util", "Format", &[TypeSig::I4])?
        .with(&interception, |value: i32| format!("#{value}"))?;

    let (mut machine, _) = console_machine(Arc::new(module), interception);
    assert_eq!(run_c(&mut machine, "Describe")?, EmValue::string("#1string"));
    Ok(())
}

#[test]
fn incompatible_delegates_are_rejected_at_registration() -> Result<()> {
    let module = rewritten()?;
    let interception = Interception::new();

    let error = Replace::method(&module, "Demo.Util", "Helper", &[TypeSig::String])?
        .with(&interception, |_: String, _: i32| 0i32)
        .unwrap_err();
    assert!(matches!(error, Error::SignatureMismatch { ref method } if method == "Helper"));

    let error = Replace::method(&module, "Demo.Util", "Helper", &[TypeSig::String])?
        .with(&interception, |_: i32| 0i32)
        .unwrap_err();
    assert!(matches!(error, Error::SignatureMismatch { .. }));

    assert!(interception.binders().is_empty()?);
    Ok(())
}

#[test]
fn generic_methods_receive_their_type_arguments() -> Result<()> {
    let module = rewritten()?;
    let interception = Arc::new(Interception::new());
    let types_seen = Arc::new(Mutex::new(Vec::new()));
    let sink = types_seen.clone();

    Replace::method(&module, "Demo.Util", "Identity", &[TypeSig::MVar(0)])?.with(
        &interception,
        Delegate::generic(
            1,
            vec![TypeSig::MVar(0)],
            TypeSig::MVar(0),
            move |args: &[EmValue], types: &[TypeSig]| {
                sink.lock().unwrap().extend(types.iter().cloned());
                Ok(EmValue::I32(args[0].as_i32().unwrap_or_default() * 6))
            },
        ),
    )?;

    let (mut machine, _) = console_machine(Arc::new(module), interception);
    assert_eq!(run_c(&mut machine, "UseGeneric")?, EmValue::I32(42));
    assert_eq!(*types_seen.lock().unwrap(), vec![TypeSig::I4]);
    Ok(())
}

#[test]
fn constructions_can_be_replaced() -> Result<()> {
    let module = rewritten()?;
    let interception = Arc::new(Interception::new());
    Replace::constructor_call_on(&module, "Demo.Person")?.with(&interception, |name: String| {
        let person = HeapObject::instance(TypeSig::class("Demo.Person"));
        person.set_field("name", EmValue::string(&format!("fake {name}")))?;
        Ok::<_, Error>(EmValue::ObjectRef(person))
    })?;

    let (mut machine, _) = console_machine(Arc::new(module), interception);
    assert_eq!(run_c(&mut machine, "MakePerson")?, EmValue::string("fake Ada"));
    Ok(())
}

#[test]
fn property_accessors_can_be_replaced() -> Result<()> {
    let module = rewritten()?;
    let interception = Arc::new(Interception::new());
    let assigned = Arc::new(Mutex::new(Vec::new()));
    let sink = assigned.clone();

    Replace::property(&module, "Demo.Person", "Name")?.with(
        &interception,
        || "intercepted".to_string(),
        move |value: String| sink.lock().unwrap().push(value),
    )?;

    let (mut machine, _) = console_machine(Arc::new(module), interception);
    assert_eq!(run_c(&mut machine, "Rename")?, EmValue::string("intercepted"));
    assert_eq!(*assigned.lock().unwrap(), vec!["Grace".to_string()]);
    Ok(())
}

#[test]
fn strict_mocking_fails_on_unmocked_calls() -> Result<()> {
    let module = Arc::new(rewritten()?);

    let interception = Arc::new(Interception::new());
    interception.add_provider(Arc::new(ExternalCallMocker::new(TypeSig::class("Demo.C"))))?;
    let (mut machine, printed) = console_machine(module.clone(), interception.clone());
    let error = run_c(&mut machine, "Do").unwrap_err();
    assert!(matches!(error, Error::MissingMock { ref method, .. } if method == "Helper"));
    assert!(printed.lock().unwrap().is_empty());

    // A failed population is not cached.
    let host = module
        .methods_of("Demo.C")
        .into_iter()
        .find(|method| method.name == "Do")
        .unwrap();
    assert!(!interception.maps().contains(&host));
    assert!(interception.maps().is_empty());

    let mut mocker = ExternalCallMocker::new(TypeSig::class("Demo.C"));
    mocker.add_static_method("Helper", |_: String| 99i32);
    let interception = Arc::new(Interception::new());
    interception.add_provider(Arc::new(mocker))?;
    let (mut machine, printed) = console_machine(module, interception);
    assert_eq!(run_c(&mut machine, "Do")?, EmValue::I32(99));
    assert!(printed.lock().unwrap().is_empty());
    Ok(())
}

#[test]
fn first_registered_rule_wins() -> Result<()> {
    let module = rewritten()?;
    let interception = Arc::new(Interception::new());
    for answer in [1i32, 2] {
        Replace::method(&module, "Demo.Util", "Helper", &[TypeSig::String])?
            .with(&interception, move |_: String| answer)?;
    }

    let (mut machine, _) = console_machine(Arc::new(module), interception);
    assert_eq!(run_c(&mut machine, "Do")?, EmValue::I32(1));
    Ok(())
}

#[test]
fn earlier_filter_rule_beats_later_exact_rule() -> Result<()> {
    let module = Arc::new(rewritten()?);

    let interception = Arc::new(Interception::new());
    Replace::methods(|method| method.name == "Helper").with(
        &interception,
        Arc::new(FnSubstitute::new(|_| Ok(EmValue::I32(111)))),
    )?;
    Replace::method(&*module, "Demo.Util", "Helper", &[TypeSig::String])?
        .with(&interception, |_: String| 222i32)?;
    let (mut machine, _) = console_machine(module.clone(), interception);
    assert_eq!(run_c(&mut machine, "Do")?, EmValue::I32(111));

    let interception = Arc::new(Interception::new());
    Replace::method(&*module, "Demo.Util", "Helper", &[TypeSig::String])?
        .with(&interception, |_: String| 222i32)?;
    Replace::methods(|method| method.name == "Helper").with(
        &interception,
        Arc::new(FnSubstitute::new(|_| Ok(EmValue::I32(111)))),
    )?;
    let (mut machine, _) = console_machine(module, interception);
    assert_eq!(run_c(&mut machine, "Do")?, EmValue::I32(222));
    Ok(())
}

#[test]
fn reset_restores_the_original_calls() -> Result<()> {
    let module = Arc::new(rewritten()?);
    let interception = Arc::new(Interception::new());
    Replace::method(&*module, "Demo.Util", "Helper", &[TypeSig::String])?
        .with(&interception, |_: String| 0i32)?;

    let (mut machine, _) = console_machine(module.clone(), interception.clone());
    assert_eq!(run_c(&mut machine, "Do")?, EmValue::I32(0));

    interception.reset()?;
    let (mut machine, printed) = console_machine(module, interception);
    assert_eq!(run_c(&mut machine, "Do")?, EmValue::I32(5));
    assert_eq!(*printed.lock().unwrap(), vec!["hello".to_string()]);
    Ok(())
}

struct CountingProvider {
    populated: AtomicUsize,
}

impl CallProvider for CountingProvider {
    fn add_method_calls(&self, request: &PopulateRequest<'_>, map: &mut CallMap) -> Result<()> {
        self.populated.fetch_add(1, Ordering::SeqCst);
        for method in request.intercepted {
            if method.name == "Helper" {
                map.add_exact(method.clone(), Arc::new((|_: String| 3i32).into_delegate()));
            }
        }
        Ok(())
    }
}

#[test]
fn concurrent_first_calls_populate_once() -> Result<()> {
    let module = Arc::new(rewritten()?);
    let provider = Arc::new(CountingProvider {
        populated: AtomicUsize::new(0),
    });
    let interception = Arc::new(Interception::new());
    interception.add_provider(provider.clone())?;

    let barrier = Arc::new(Barrier::new(8));
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let module = module.clone();
            let interception = interception.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let (mut machine, _) = console_machine(module, interception);
                barrier.wait();
                run_c(&mut machine, "Do")
            })
        })
        .collect();

    for worker in workers {
        assert_eq!(worker.join().unwrap()?, EmValue::I32(3));
    }
    assert_eq!(provider.populated.load(Ordering::SeqCst), 1);
    assert_eq!(interception.maps().len(), 1);
    Ok(())
}

#[test]
fn rewriting_twice_changes_nothing() -> Result<()> {
    let mut module = rewritten()?;
    let once = module.to_bytes()?;

    let options = RewriteOptions::default();
    let report = rewrite_module(&mut module, &mut CallSiteRewriter::new(options.clone()), &options)?;
    assert_eq!(report.rewritten, 0);
    assert_eq!(report.skipped, report.visited);
    assert_eq!(module.to_bytes()?, once);
    Ok(())
}
