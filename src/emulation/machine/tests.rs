use std::sync::{Arc, Mutex};

use crate::{
    assembly::InstructionAssembler,
    emulation::{EmValue, EmulationError, Machine, MachineLimits},
    interception::Interception,
    metadata::{
        body::MethodBody,
        method::{MethodFlags, MethodSig},
        module::{FieldDef, MemberRef, MethodDef, TypeDef},
        token::Token,
        typesig::TypeSig,
    },
    Error, Module, Result,
};

fn body<F>(build: F) -> MethodBody
where
    F: FnOnce(&mut InstructionAssembler) -> Result<()>,
{
    let mut asm = InstructionAssembler::new();
    build(&mut asm).unwrap();
    let (code, _) = asm.finish().unwrap();
    MethodBody::new(code)
}

fn machine(module: Module) -> Machine {
    Machine::new(Arc::new(module), Arc::new(Interception::new()))
}

fn object_ctor(module: &mut Module) -> Token {
    module
        .add_member_ref(MemberRef {
            parent: TypeSig::Object,
            name: ".ctor".to_string(),
            signature: MethodSig {
                has_this: true,
                parameters: vec![],
                return_type: TypeSig::Void,
                generic_param_count: 0,
            },
        })
        .unwrap()
}

fn default_ctor(module: &mut Module, owner: Token, base_ctor: Token) -> Token {
    module
        .add_method(
            MethodDef::new(owner, ".ctor")
                .with_flags(MethodFlags::CONSTRUCTOR | MethodFlags::SPECIAL_NAME)
                .with_body(body(|asm| {
                    asm.ldarg(0)?.call(base_ctor)?.ret()?;
                    Ok(())
                })),
        )
        .unwrap()
}

#[test]
fn branches_and_arithmetic() {
    let mut module = Module::new("Demo");
    let util = module.add_type(TypeDef::class("Demo.Util"));
    let abs = module
        .add_method(
            MethodDef::new(util, "Abs")
                .with_flags(MethodFlags::STATIC)
                .with_parameters(vec![TypeSig::I4])
                .returns(TypeSig::I4)
                .with_body(body(|asm| {
                    asm.ldarg(0)?
                        .ldc_i4(0)?
                        .bge("positive")?
                        .ldarg(0)?
                        .neg()?
                        .ret()?
                        .label("positive")?
                        .ldarg(0)?
                        .ret()?;
                    Ok(())
                })),
        )
        .unwrap();

    let mut machine = machine(module);
    assert_eq!(machine.invoke(abs, None, vec![EmValue::I32(-7)]).unwrap(), EmValue::I32(7));
    assert_eq!(machine.invoke(abs, None, vec![EmValue::I32(3)]).unwrap(), EmValue::I32(3));
}

#[test]
fn loops_with_locals() {
    let mut module = Module::new("Demo");
    let util = module.add_type(TypeDef::class("Demo.Util"));
    let sum = module
        .add_method(
            MethodDef::new(util, "Sum")
                .with_flags(MethodFlags::STATIC)
                .with_parameters(vec![TypeSig::I4])
                .returns(TypeSig::I4)
                .with_body(
                    body(|asm| {
                        asm.ldc_i4(0)?
                            .stloc(0)?
                            .ldc_i4(1)?
                            .stloc(1)?
                            .label("loop")?
                            .ldloc(1)?
                            .ldarg(0)?
                            .bgt("done")?
                            .ldloc(0)?
                            .ldloc(1)?
                            .add()?
                            .stloc(0)?
                            .ldloc(1)?
                            .ldc_i4(1)?
                            .add()?
                            .stloc(1)?
                            .br("loop")?
                            .label("done")?
                            .ldloc(0)?
                            .ret()?;
                        Ok(())
                    })
                    .with_locals(vec![TypeSig::I4, TypeSig::I4]),
                ),
        )
        .unwrap();

    let mut machine = machine(module);
    assert_eq!(machine.invoke(sum, None, vec![EmValue::I32(10)]).unwrap(), EmValue::I32(55));
    assert!(machine.instructions_executed() > 50);
}

#[test]
fn virtual_dispatch_uses_runtime_type() {
    let mut module = Module::new("Demo");
    let base_ctor = object_ctor(&mut module);
    let animal = module.add_type(TypeDef::class("Demo.Animal"));
    let dog = module.add_type(TypeDef::class("Demo.Dog").extends(TypeSig::class("Demo.Animal")));
    let quiet = module.add_user_string("...").unwrap();
    let woof = module.add_user_string("Woof").unwrap();

    let animal_ctor = default_ctor(&mut module, animal, base_ctor);
    let dog_ctor = default_ctor(&mut module, dog, animal_ctor);
    let speak = module
        .add_method(
            MethodDef::new(animal, "Speak")
                .with_flags(MethodFlags::VIRTUAL)
                .returns(TypeSig::String)
                .with_body(body(|asm| {
                    asm.ldstr(quiet)?.ret()?;
                    Ok(())
                })),
        )
        .unwrap();
    module
        .add_method(
            MethodDef::new(dog, "Speak")
                .with_flags(MethodFlags::VIRTUAL)
                .returns(TypeSig::String)
                .with_body(body(|asm| {
                    asm.ldstr(woof)?.ret()?;
                    Ok(())
                })),
        )
        .unwrap();
    let program = module.add_type(TypeDef::class("Demo.Program"));
    module
        .add_method(
            MethodDef::new(program, "Run")
                .with_flags(MethodFlags::STATIC)
                .returns(TypeSig::String)
                .with_body(body(|asm| {
                    asm.newobj(dog_ctor)?.callvirt(speak)?.ret()?;
                    Ok(())
                })),
        )
        .unwrap();
    module
        .add_method(
            MethodDef::new(program, "RunBase")
                .with_flags(MethodFlags::STATIC)
                .returns(TypeSig::String)
                .with_body(body(|asm| {
                    asm.newobj(dog_ctor)?.call(speak)?.ret()?;
                    Ok(())
                })),
        )
        .unwrap();

    let mut machine = machine(module);
    assert_eq!(
        machine.invoke_by_name("Demo.Program", "Run", None, vec![]).unwrap(),
        EmValue::string("Woof")
    );
    assert_eq!(
        machine.invoke_by_name("Demo.Program", "RunBase", None, vec![]).unwrap(),
        EmValue::string("...")
    );
}

#[test]
fn instance_and_static_fields() {
    let mut module = Module::new("Demo");
    let base_ctor = object_ctor(&mut module);
    let counter = module.add_type(TypeDef::class("Demo.Counter"));
    default_ctor(&mut module, counter, base_ctor);
    let count = module
        .add_field(FieldDef {
            owner: counter,
            name: "count".to_string(),
            field_type: TypeSig::I4,
            is_static: false,
        })
        .unwrap();
    let total = module
        .add_field(FieldDef {
            owner: counter,
            name: "total".to_string(),
            field_type: TypeSig::I4,
            is_static: true,
        })
        .unwrap();
    module
        .add_method(MethodDef::new(counter, "Increment").with_body(body(|asm| {
            asm.ldarg(0)?
                .ldarg(0)?
                .ldfld(count)?
                .ldc_i4(1)?
                .add()?
                .stfld(count)?
                .ldsfld(total)?
                .ldc_i4(1)?
                .add()?
                .stsfld(total)?
                .ret()?;
            Ok(())
        })))
        .unwrap();
    module
        .add_method(
            MethodDef::new(counter, "Get")
                .returns(TypeSig::I4)
                .with_body(body(|asm| {
                    asm.ldarg(0)?.ldfld(count)?.ret()?;
                    Ok(())
                })),
        )
        .unwrap();

    let mut machine = machine(module);
    let first = machine.new_object("Demo.Counter", vec![]).unwrap();
    let second = machine.new_object("Demo.Counter", vec![]).unwrap();
    for receiver in [&first, &first, &second] {
        machine
            .invoke_by_name("Demo.Counter", "Increment", Some(receiver.clone()), vec![])
            .unwrap();
    }

    assert_eq!(
        machine.invoke_by_name("Demo.Counter", "Get", Some(first), vec![]).unwrap(),
        EmValue::I32(2)
    );
    assert_eq!(machine.static_field("Demo.Counter", "total").unwrap(), EmValue::I32(3));
    machine.set_static_field("Demo.Counter", "total", EmValue::I32(0)).unwrap();
    assert_eq!(machine.static_field("Demo.Counter", "total").unwrap(), EmValue::I32(0));
    assert!(machine.static_field("Demo.Counter", "count").is_err());
}

#[test]
fn natives_and_strings() {
    let mut module = Module::new("Demo");
    let util = module.add_type(TypeDef::class("Demo.Util"));
    let hello = module.add_user_string("Hello, ").unwrap();
    let concat = module
        .add_member_ref(MemberRef {
            parent: TypeSig::String,
            name: "Concat".to_string(),
            signature: MethodSig {
                has_this: false,
                parameters: vec![TypeSig::String, TypeSig::String],
                return_type: TypeSig::String,
                generic_param_count: 0,
            },
        })
        .unwrap();
    let write_line = module
        .add_member_ref(MemberRef {
            parent: TypeSig::class("System.Console"),
            name: "WriteLine".to_string(),
            signature: MethodSig {
                has_this: false,
                parameters: vec![TypeSig::String],
                return_type: TypeSig::Void,
                generic_param_count: 0,
            },
        })
        .unwrap();
    let greet = module
        .add_method(
            MethodDef::new(util, "Greet")
                .with_flags(MethodFlags::STATIC)
                .with_parameters(vec![TypeSig::String])
                .with_body(body(|asm| {
                    asm.ldstr(hello)?
                        .ldarg(0)?
                        .call(concat)?
                        .call(write_line)?
                        .ret()?;
                    Ok(())
                })),
        )
        .unwrap();

    let printed = Arc::new(Mutex::new(Vec::new()));
    let sink = printed.clone();
    let mut machine = machine(module);
    machine
        .natives_mut()
        .register("System.Console", "WriteLine", 1, move |call| {
            sink.lock().unwrap().push(call.str_arg(0)?);
            Ok(EmValue::Void)
        });

    machine.invoke(greet, None, vec![EmValue::string("Bob")]).unwrap();
    assert_eq!(*printed.lock().unwrap(), vec!["Hello, Bob".to_string()]);
}

#[test]
fn thrown_exceptions_carry_their_message() {
    let mut module = Module::new("Demo");
    let util = module.add_type(TypeDef::class("Demo.Util"));
    let message = module.add_user_string("not today").unwrap();
    let ctor = module
        .add_member_ref(MemberRef {
            parent: TypeSig::class("System.InvalidOperationException"),
            name: ".ctor".to_string(),
            signature: MethodSig {
                has_this: true,
                parameters: vec![TypeSig::String],
                return_type: TypeSig::Void,
                generic_param_count: 0,
            },
        })
        .unwrap();
    let fail = module
        .add_method(
            MethodDef::new(util, "Fail")
                .with_flags(MethodFlags::STATIC)
                .with_body(body(|asm| {
                    asm.ldstr(message)?.newobj(ctor)?.throw()?;
                    Ok(())
                })),
        )
        .unwrap();

    let error = machine(module).invoke(fail, None, vec![]).unwrap_err();
    assert_eq!(
        error.to_string(),
        "unhandled exception System.InvalidOperationException: not today"
    );
}

#[test]
fn missing_external_method() {
    let mut module = Module::new("Demo");
    let util = module.add_type(TypeDef::class("Demo.Util"));
    let external = module
        .add_member_ref(MemberRef {
            parent: TypeSig::class("Demo.External"),
            name: "Run".to_string(),
            signature: MethodSig {
                has_this: false,
                parameters: vec![],
                return_type: TypeSig::Void,
                generic_param_count: 0,
            },
        })
        .unwrap();
    let run = module
        .add_method(
            MethodDef::new(util, "Run")
                .with_flags(MethodFlags::STATIC)
                .with_body(body(|asm| {
                    asm.call(external)?.ret()?;
                    Ok(())
                })),
        )
        .unwrap();

    assert!(matches!(
        machine(module).invoke(run, None, vec![]),
        Err(Error::Emulation(EmulationError::MissingMethod { method })) if method == "Demo.External::Run"
    ));
}

#[test]
fn limits_are_enforced() {
    let mut module = Module::new("Demo");
    let util = module.add_type(TypeDef::class("Demo.Util"));
    let recurse = module
        .add_method(MethodDef::new(util, "Recurse").with_flags(MethodFlags::STATIC))
        .unwrap();
    module.method_mut(recurse).unwrap().body = Some(body(|asm| {
        asm.call(recurse)?.ret()?;
        Ok(())
    }));
    let spin = module
        .add_method(
            MethodDef::new(util, "Spin")
                .with_flags(MethodFlags::STATIC)
                .with_body(body(|asm| {
                    asm.label("top")?.br("top")?;
                    Ok(())
                })),
        )
        .unwrap();
    let overflow = module
        .add_method(
            MethodDef::new(util, "Overflow")
                .with_flags(MethodFlags::STATIC)
                .with_body(
                    body(|asm| {
                        asm.ldc_i4(1)?.ldc_i4(2)?.pop()?.pop()?.ret()?;
                        Ok(())
                    })
                    .with_max_stack(1),
                ),
        )
        .unwrap();

    let mut machine = machine(module).with_limits(MachineLimits {
        max_call_depth: 16,
        max_instructions: 1_000,
    });
    assert!(matches!(
        machine.invoke(recurse, None, vec![]),
        Err(Error::Emulation(EmulationError::CallDepthExceeded { limit: 16 }))
    ));
    assert!(matches!(
        machine.invoke(spin, None, vec![]),
        Err(Error::Emulation(EmulationError::InstructionLimitExceeded { limit: 1_000 }))
    ));
    assert!(matches!(
        machine.invoke(overflow, None, vec![]),
        Err(Error::Emulation(EmulationError::StackOverflow { limit: 1 }))
    ));
}

#[test]
fn arrays_and_boxing() {
    let mut module = Module::new("Demo");
    let util = module.add_type(TypeDef::class("Demo.Util"));
    let object = module.type_token(&TypeSig::Object).unwrap();
    let int32 = module.type_token(&TypeSig::I4).unwrap();
    let roundtrip = module
        .add_method(
            MethodDef::new(util, "RoundTrip")
                .with_flags(MethodFlags::STATIC)
                .with_parameters(vec![TypeSig::I4])
                .returns(TypeSig::I4)
                .with_body(
                    body(|asm| {
                        asm.ldc_i4(2)?
                            .newarr(object)?
                            .stloc(0)?
                            .ldloc(0)?
                            .ldc_i4(1)?
                            .ldarg(0)?
                            .box_value(int32)?
                            .stelem_ref()?
                            .ldloc(0)?
                            .ldlen()?
                            .ldloc(0)?
                            .ldc_i4(1)?
                            .ldelem_ref()?
                            .unbox_any(int32)?
                            .add()?
                            .ret()?;
                        Ok(())
                    })
                    .with_locals(vec![TypeSig::sz_array(TypeSig::Object)]),
                ),
        )
        .unwrap();

    assert_eq!(
        machine(module).invoke(roundtrip, None, vec![EmValue::I32(40)]).unwrap(),
        EmValue::I32(42)
    );
}
