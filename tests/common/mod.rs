//! A small hand-assembled module shared by the integration tests.
//!
//! `Demo.C` is the code under test. It calls into `Demo.Util` and constructs `Demo.Person`,
//! which stand in for the dependencies a test wants to replace.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use dotshim::{
    assembly::InstructionAssembler,
    emulation::{EmValue, Machine},
    interception::Interception,
    metadata::{
        body::MethodBody,
        method::{MethodFlags, MethodSig},
        module::{FieldDef, MemberRef, MethodDef, MethodSpec, TypeDef},
        token::Token,
        typesig::TypeSig,
    },
    Module, Result,
};

pub fn body<F>(build: F) -> Result<MethodBody>
where
    F: FnOnce(&mut InstructionAssembler) -> Result<()>,
{
    let mut asm = InstructionAssembler::new();
    build(&mut asm)?;
    let (code, _) = asm.finish()?;
    Ok(MethodBody::new(code))
}

fn external(
    module: &mut Module,
    parent: TypeSig,
    name: &str,
    has_this: bool,
    parameters: Vec<TypeSig>,
    return_type: TypeSig,
) -> Result<Token> {
    module.add_member_ref(MemberRef {
        parent,
        name: name.to_string(),
        signature: MethodSig {
            has_this,
            parameters,
            return_type,
            generic_param_count: 0,
        },
    })
}

/// Builds the demo module.
///
/// | Method                  | Does                                                         |
/// |-------------------------|--------------------------------------------------------------|
/// | `Util::Helper(string)`  | prints its argument, returns its length                      |
/// | `Util::Format(int32)`   | returns `"int"`                                              |
/// | `Util::Format(string)`  | returns `"string"`                                           |
/// | `Util::Identity<T>(T)`  | returns its argument                                         |
/// | `C::Do()`               | `Helper("hello")`                                            |
/// | `C::Describe()`         | `Format(1) + Format("x")`                                    |
/// | `C::UseGeneric()`       | `Identity<int32>(7)`                                         |
/// | `C::MakePerson()`       | `new Person("Ada").Name`                                     |
/// | `C::Rename()`           | `p = new Person("Ada"); p.Name = "Grace"; p.Name`            |
pub fn demo_module() -> Result<Module> {
    let mut module = Module::new("Demo");

    let object_ctor = external(&mut module, TypeSig::Object, ".ctor", true, vec![], TypeSig::Void)?;
    let write_line = external(
        &mut module,
        TypeSig::class("System.Console"),
        "WriteLine",
        false,
        vec![TypeSig::String],
        TypeSig::Void,
    )?;
    let length = external(&mut module, TypeSig::String, "get_Length", true, vec![], TypeSig::I4)?;
    let concat = external(
        &mut module,
        TypeSig::String,
        "Concat",
        false,
        vec![TypeSig::String, TypeSig::String],
        TypeSig::String,
    )?;

    let hello = module.add_user_string("hello")?;
    let int_text = module.add_user_string("int")?;
    let string_text = module.add_user_string("string")?;
    let x = module.add_user_string("x")?;
    let ada = module.add_user_string("Ada")?;
    let grace = module.add_user_string("Grace")?;

    // Demo.Util
    let util = module.add_type(TypeDef::class("Demo.Util"));
    let helper = module.add_method(
        MethodDef::new(util, "Helper")
            .with_flags(MethodFlags::STATIC)
            .with_parameters(vec![TypeSig::String])
            .returns(TypeSig::I4)
            .with_body(body(|asm| {
                asm.ldarg(0)?
                    .call(write_line)?
                    .ldarg(0)?
                    .callvirt(length)?
                    .ret()?;
                Ok(())
            })?),
    )?;
    let format_int = module.add_method(
        MethodDef::new(util, "Format")
            .with_flags(MethodFlags::STATIC)
            .with_parameters(vec![TypeSig::I4])
            .returns(TypeSig::String)
            .with_body(body(|asm| {
                asm.ldstr(int_text)?.ret()?;
                Ok(())
            })?),
    )?;
    let format_string = module.add_method(
        MethodDef::new(util, "Format")
            .with_flags(MethodFlags::STATIC)
            .with_parameters(vec![TypeSig::String])
            .returns(TypeSig::String)
            .with_body(body(|asm| {
                asm.ldstr(string_text)?.ret()?;
                Ok(())
            })?),
    )?;
    let identity = module.add_method(
        MethodDef::new(util, "Identity")
            .with_flags(MethodFlags::STATIC)
            .generic(1)
            .with_parameters(vec![TypeSig::MVar(0)])
            .returns(TypeSig::MVar(0))
            .with_body(body(|asm| {
                asm.ldarg(0)?.ret()?;
                Ok(())
            })?),
    )?;
    let identity_int = module.add_method_spec(MethodSpec {
        method: identity,
        instantiation: vec![TypeSig::I4],
    })?;

    // Demo.Person
    let person = module.add_type(TypeDef::class("Demo.Person"));
    let name = module.add_field(FieldDef {
        owner: person,
        name: "name".to_string(),
        field_type: TypeSig::String,
        is_static: false,
    })?;
    let person_ctor = module.add_method(
        MethodDef::new(person, ".ctor")
            .with_flags(MethodFlags::CONSTRUCTOR | MethodFlags::SPECIAL_NAME)
            .with_parameters(vec![TypeSig::String])
            .with_body(body(|asm| {
                asm.ldarg(0)?
                    .call(object_ctor)?
                    .ldarg(0)?
                    .ldarg(1)?
                    .stfld(name)?
                    .ret()?;
                Ok(())
            })?),
    )?;
    let get_name = module.add_method(
        MethodDef::new(person, "get_Name")
            .with_flags(MethodFlags::SPECIAL_NAME)
            .returns(TypeSig::String)
            .with_body(body(|asm| {
                asm.ldarg(0)?.ldfld(name)?.ret()?;
                Ok(())
            })?),
    )?;
    let set_name = module.add_method(
        MethodDef::new(person, "set_Name")
            .with_flags(MethodFlags::SPECIAL_NAME)
            .with_parameters(vec![TypeSig::String])
            .with_body(body(|asm| {
                asm.ldarg(0)?.ldarg(1)?.stfld(name)?.ret()?;
                Ok(())
            })?),
    )?;

    // Demo.C
    let c = module.add_type(TypeDef::class("Demo.C"));
    module.add_method(
        MethodDef::new(c, ".ctor")
            .with_flags(MethodFlags::CONSTRUCTOR | MethodFlags::SPECIAL_NAME)
            .with_body(body(|asm| {
                asm.ldarg(0)?.call(object_ctor)?.ret()?;
                Ok(())
            })?),
    )?;
    module.add_method(MethodDef::new(c, "Do").returns(TypeSig::I4).with_body(body(|asm| {
        asm.ldstr(hello)?.call(helper)?.ret()?;
        Ok(())
    })?))?;
    module.add_method(
        MethodDef::new(c, "Describe")
            .returns(TypeSig::String)
            .with_body(body(|asm| {
                asm.ldc_i4(1)?
                    .call(format_int)?
                    .ldstr(x)?
                    .call(format_string)?
                    .call(concat)?
                    .ret()?;
                Ok(())
            })?),
    )?;
    module.add_method(
        MethodDef::new(c, "UseGeneric")
            .returns(TypeSig::I4)
            .with_body(body(|asm| {
                asm.ldc_i4(7)?.call(identity_int)?.ret()?;
                Ok(())
            })?),
    )?;
    module.add_method(
        MethodDef::new(c, "MakePerson")
            .returns(TypeSig::String)
            .with_body(body(|asm| {
                asm.ldstr(ada)?.newobj(person_ctor)?.call(get_name)?.ret()?;
                Ok(())
            })?),
    )?;
    module.add_method(
        MethodDef::new(c, "Rename")
            .returns(TypeSig::String)
            .with_body(
                body(|asm| {
                    asm.ldstr(ada)?
                        .newobj(person_ctor)?
                        .stloc(0)?
                        .ldloc(0)?
                        .ldstr(grace)?
                        .call(set_name)?
                        .ldloc(0)?
                        .call(get_name)?
                        .ret()?;
                    Ok(())
                })?
                .with_locals(vec![TypeSig::class("Demo.Person")]),
            ),
    )?;

    Ok(module)
}

/// A machine over `module` that records what `System.Console::WriteLine` prints.
pub fn console_machine(
    module: Arc<Module>,
    interception: Arc<Interception>,
) -> (Machine, Arc<Mutex<Vec<String>>>) {
    let printed = Arc::new(Mutex::new(Vec::new()));
    let sink = printed.clone();
    let mut machine = Machine::new(module, interception);
    machine
        .natives_mut()
        .register("System.Console", "WriteLine", 1, move |call| {
            sink.lock().unwrap().push(call.str_arg(0)?);
            Ok(EmValue::Void)
        });
    (machine, printed)
}

/// Construct a `Demo.C` and run `method` on it.
pub fn run_c(machine: &mut Machine, method: &str) -> Result<EmValue> {
    let c = machine.new_object("Demo.C", vec![])?;
    machine.invoke_by_name("Demo.C", method, Some(c), vec![])
}
