//! Binary container for [`Module`]s.
//!
//! # Layout
//!
//! All integers are little-endian; counts and string lengths are ECMA-335 compressed
//! unsigned integers; type signatures use [`TypeSig::encode`].
//!
//! ```text
//! magic      "DSHM"
//! version    u16 (1)
//! flags      u16 (bit 0: symbols section present)
//! name       UTF-8 string
//! mvid       16 bytes
//! types      count, { name, flags u32, generic count, has_base u8, [base], interfaces }
//! fields     count, { owner token, name, type, is_static u8 }
//! methods    count, { owner token, name, flags u16, generic count, parameters, return,
//!                     has_body u8, [locals, body bytes (tiny/fat header + code)] }
//! memberrefs count, { parent, name, has_this u8, generic count, parameters, return }
//! specs      count, { method token, type arguments }
//! typespecs  count, { type }
//! strings    count, { UTF-16 string }
//! processed  count, { method token }
//! symbols    count, { method token, sequence point blob }   (only with flag bit 0)
//! ```

use bitflags::bitflags;
use uguid::Guid;

use crate::{
    file::{parser::Parser, writer::Writer},
    metadata::{
        body::MethodBody,
        method::{MethodFlags, MethodSig},
        module::{FieldDef, MemberRef, MethodDef, MethodSpec, Module, TypeDef, TypeFlags},
        sequencepoints::parse_sequence_points,
        token::{TableId, Token},
        typesig::TypeSig,
    },
    Error, Result,
};

/// Container magic.
pub const MAGIC: &[u8; 4] = b"DSHM";

/// The only container version understood.
pub const VERSION: u16 = 1;

bitflags! {
    /// Header flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ContainerFlags: u16 {
        /// A symbols section follows the processed table
        const HAS_SYMBOLS = 0x0001;
    }
}

/// Parse a container.
///
/// # Errors
/// Returns [`Error::NotSupported`] for a wrong magic or version, [`Error::Malformed`] for
/// structural damage (including dangling tokens), [`Error::OutOfBounds`] for truncation.
pub fn read_module(data: &[u8]) -> Result<Module> {
    if data.is_empty() {
        return Err(Error::Empty);
    }

    let mut parser = Parser::new(data);
    if parser.read_bytes(MAGIC.len())? != MAGIC {
        return Err(Error::NotSupported);
    }
    if parser.read_le::<u16>()? != VERSION {
        return Err(Error::NotSupported);
    }
    let flags = ContainerFlags::from_bits_truncate(parser.read_le::<u16>()?);

    let mut module = Module::new(parser.read_prefixed_string_utf8()?);
    let mut mvid = [0u8; 16];
    mvid.copy_from_slice(parser.read_bytes(16)?);
    module.mvid = Guid::from_bytes(mvid);

    for _ in 0..parser.read_length()? {
        module.types.push(read_type(&mut parser)?);
    }

    for _ in 0..parser.read_length()? {
        let owner = parser.read_token()?;
        let name = parser.read_prefixed_string_utf8()?;
        let field_type = TypeSig::decode(&mut parser)?;
        let is_static = parser.read_le::<u8>()? != 0;
        module.add_field(FieldDef {
            owner,
            name,
            field_type,
            is_static,
        })?;
    }

    for _ in 0..parser.read_length()? {
        let method = read_method(&mut parser)?;
        module.add_method(method)?;
    }

    for _ in 0..parser.read_length()? {
        let parent = TypeSig::decode(&mut parser)?;
        let name = parser.read_prefixed_string_utf8()?;
        let signature = read_method_sig(&mut parser)?;
        module.member_refs.push(MemberRef {
            parent,
            name,
            signature,
        });
    }

    for _ in 0..parser.read_length()? {
        let method = parser.read_token()?;
        let instantiation = read_type_list(&mut parser)?;
        module.method_specs.push(MethodSpec {
            method,
            instantiation,
        });
    }

    for _ in 0..parser.read_length()? {
        module.type_specs.push(TypeSig::decode(&mut parser)?);
    }

    for _ in 0..parser.read_length()? {
        module
            .user_strings
            .push(parser.read_prefixed_string_utf16()?);
    }

    for _ in 0..parser.read_length()? {
        let token = parser.read_token()?;
        module.method(token)?;
        module.mark_processed(token);
    }

    if flags.contains(ContainerFlags::HAS_SYMBOLS) {
        for _ in 0..parser.read_length()? {
            let token = parser.read_token()?;
            let length = parser.read_length()?;
            let points = parse_sequence_points(parser.read_bytes(length)?)?;
            match module.method_mut(token)?.body.as_mut() {
                Some(body) => body.sequence_points = points,
                None => {
                    return Err(malformed_error!(
                        "Symbols for method {} which has no body",
                        token
                    ))
                }
            }
        }
    }

    if parser.has_more_data() {
        return Err(malformed_error!(
            "{} trailing bytes after the module container",
            parser.remaining()
        ));
    }

    validate_references(&module)?;
    Ok(module)
}

/// Serialize a module.
///
/// # Errors
/// Returns [`Error::Malformed`] when a value does not fit the encoding.
pub fn write_module(module: &Module) -> Result<Vec<u8>> {
    let has_symbols = module
        .methods
        .iter()
        .any(|method| method.body.as_ref().is_some_and(|body| !body.sequence_points.is_empty()));

    let mut flags = ContainerFlags::empty();
    if has_symbols {
        flags |= ContainerFlags::HAS_SYMBOLS;
    }

    let mut writer = Writer::new();
    writer.write_bytes(MAGIC);
    writer.write_le::<u16>(VERSION);
    writer.write_le::<u16>(flags.bits());
    writer.write_prefixed_string_utf8(&module.name)?;
    writer.write_bytes(&module.mvid.to_bytes());

    writer.write_length(module.types.len())?;
    for def in &module.types {
        writer.write_prefixed_string_utf8(&def.name)?;
        writer.write_le::<u32>(def.flags.bits());
        writer.write_compressed_uint(def.generic_param_count)?;
        match &def.base {
            Some(base) => {
                writer.write_le::<u8>(1);
                base.encode(&mut writer)?;
            }
            None => writer.write_le::<u8>(0),
        }
        write_type_list(&mut writer, &def.interfaces)?;
    }

    writer.write_length(module.fields.len())?;
    for def in &module.fields {
        writer.write_token(def.owner);
        writer.write_prefixed_string_utf8(&def.name)?;
        def.field_type.encode(&mut writer)?;
        writer.write_le::<u8>(u8::from(def.is_static));
    }

    writer.write_length(module.methods.len())?;
    for def in &module.methods {
        writer.write_token(def.owner);
        writer.write_prefixed_string_utf8(&def.name)?;
        writer.write_le::<u16>(def.flags.bits());
        writer.write_compressed_uint(def.generic_param_count)?;
        write_type_list(&mut writer, &def.parameters)?;
        def.return_type.encode(&mut writer)?;
        match &def.body {
            Some(body) => {
                writer.write_le::<u8>(1);
                write_type_list(&mut writer, &body.locals)?;
                writer.write_bytes(&body.to_bytes()?);
            }
            None => writer.write_le::<u8>(0),
        }
    }

    writer.write_length(module.member_refs.len())?;
    for member in &module.member_refs {
        member.parent.encode(&mut writer)?;
        writer.write_prefixed_string_utf8(&member.name)?;
        writer.write_le::<u8>(u8::from(member.signature.has_this));
        writer.write_compressed_uint(member.signature.generic_param_count)?;
        write_type_list(&mut writer, &member.signature.parameters)?;
        member.signature.return_type.encode(&mut writer)?;
    }

    writer.write_length(module.method_specs.len())?;
    for spec in &module.method_specs {
        writer.write_token(spec.method);
        write_type_list(&mut writer, &spec.instantiation)?;
    }

    writer.write_length(module.type_specs.len())?;
    for sig in &module.type_specs {
        sig.encode(&mut writer)?;
    }

    writer.write_length(module.user_strings.len())?;
    for value in &module.user_strings {
        writer.write_prefixed_string_utf16(value)?;
    }

    writer.write_length(module.processed.len())?;
    for token in &module.processed {
        writer.write_token(*token);
    }

    if has_symbols {
        let with_points: Vec<(Token, &MethodBody)> = module
            .methods()
            .filter_map(|(token, def)| def.body.as_ref().map(|body| (token, body)))
            .filter(|(_, body)| !body.sequence_points.is_empty())
            .collect();

        writer.write_length(with_points.len())?;
        for (token, body) in with_points {
            writer.write_token(token);
            let blob = body.sequence_points.to_bytes()?;
            writer.write_length(blob.len())?;
            writer.write_bytes(&blob);
        }
    }

    Ok(writer.into_inner())
}

fn read_type(parser: &mut Parser) -> Result<TypeDef> {
    let name = parser.read_prefixed_string_utf8()?;
    let flags = TypeFlags::from_bits_truncate(parser.read_le::<u32>()?);
    let generic_param_count = parser.read_compressed_uint()?;
    let base = match parser.read_le::<u8>()? {
        0 => None,
        1 => Some(TypeSig::decode(parser)?),
        other => return Err(malformed_error!("Invalid base type marker {}", other)),
    };
    let interfaces = read_type_list(parser)?;

    Ok(TypeDef {
        name,
        base,
        interfaces,
        flags,
        generic_param_count,
    })
}

fn read_method(parser: &mut Parser) -> Result<MethodDef> {
    let owner = parser.read_token()?;
    let name = parser.read_prefixed_string_utf8()?;
    let flags = MethodFlags::from_bits_truncate(parser.read_le::<u16>()?);
    let generic_param_count = parser.read_compressed_uint()?;
    let parameters = read_type_list(parser)?;
    let return_type = TypeSig::decode(parser)?;

    let body = match parser.read_le::<u8>()? {
        0 => None,
        1 => {
            let locals = read_type_list(parser)?;
            let start = parser.pos();
            let rest = parser.read_bytes(parser.remaining())?;
            let (mut body, consumed) = MethodBody::from(rest)?;
            parser.seek(start + consumed)?;
            body.locals = locals;
            Some(body)
        }
        other => return Err(malformed_error!("Invalid body marker {}", other)),
    };

    Ok(MethodDef {
        owner,
        name,
        flags,
        parameters,
        return_type,
        generic_param_count,
        body,
    })
}

fn read_method_sig(parser: &mut Parser) -> Result<MethodSig> {
    let has_this = parser.read_le::<u8>()? != 0;
    let generic_param_count = parser.read_compressed_uint()?;
    let parameters = read_type_list(parser)?;
    let return_type = TypeSig::decode(parser)?;

    Ok(MethodSig {
        has_this,
        parameters,
        return_type,
        generic_param_count,
    })
}

fn read_type_list(parser: &mut Parser) -> Result<Vec<TypeSig>> {
    let count = parser.read_length()?;
    let mut list = Vec::with_capacity(count);
    for _ in 0..count {
        list.push(TypeSig::decode(parser)?);
    }
    Ok(list)
}

fn write_type_list(writer: &mut Writer, list: &[TypeSig]) -> Result<()> {
    writer.write_length(list.len())?;
    for sig in list {
        sig.encode(writer)?;
    }
    Ok(())
}

/// Every MethodSpec must point at an existing method; instruction operands are checked
/// lazily when a body is decoded.
fn validate_references(module: &Module) -> Result<()> {
    for spec in &module.method_specs {
        match spec.method.table_id() {
            Some(TableId::MethodDef) => {
                module.method(spec.method)?;
            }
            Some(TableId::MemberRef) => {
                module.member_ref(spec.method)?;
            }
            _ => {
                return Err(malformed_error!(
                    "MethodSpec refers to {}, which is not a method",
                    spec.method
                ))
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::InstructionAssembler,
        metadata::sequencepoints::{SequencePoint, SequencePoints},
    };

    fn sample() -> Module {
        let mut module = Module::new("Demo");
        module.mvid = Guid::from_bytes([7; 16]);
        let util = module.add_type(TypeDef::class("Demo.Util"));

        let hello = module.add_user_string("Grüße").unwrap();
        let helper = module
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

        let mut asm = InstructionAssembler::new();
        asm.ldstr(hello).unwrap().call(helper).unwrap().ret().unwrap();
        let (code, _) = asm.finish().unwrap();

        let body = MethodBody::new(code)
            .with_locals(vec![TypeSig::I4])
            .with_sequence_points(SequencePoints(vec![SequencePoint {
                il_offset: 0,
                start_line: 12,
                start_col: 9,
                end_line: 12,
                end_col: 30,
                is_hidden: false,
            }]));
        let run = module
            .add_method(
                MethodDef::new(util, "Run")
                    .with_flags(MethodFlags::STATIC)
                    .with_body(body),
            )
            .unwrap();
        module.mark_processed(run);
        module
    }

    #[test]
    fn round_trip() {
        let module = sample();
        let data = write_module(&module).unwrap();
        let loaded = read_module(&data).unwrap();

        assert_eq!(loaded, module);
        assert_eq!(write_module(&loaded).unwrap(), data);
    }

    #[test]
    fn wrong_magic() {
        let mut data = write_module(&sample()).unwrap();
        data[0] = b'X';
        assert!(matches!(read_module(&data), Err(Error::NotSupported)));
    }

    #[test]
    fn wrong_version() {
        let mut data = write_module(&sample()).unwrap();
        data[4] = 2;
        assert!(matches!(read_module(&data), Err(Error::NotSupported)));
    }

    #[test]
    fn truncated_everywhere() {
        let data = write_module(&sample()).unwrap();
        for len in 1..data.len() {
            assert!(read_module(&data[..len]).is_err(), "prefix of {len} bytes parsed");
        }
    }

    #[test]
    fn empty_input() {
        assert!(matches!(read_module(&[]), Err(Error::Empty)));
    }
}
