//! Instruction handlers.

use std::{cmp::Ordering, sync::Arc};

use crate::{
    assembly::{opcodes::*, Immediate, Instruction, Operand},
    emulation::{
        machine::{Frame, Machine, StepResult},
        natives::EXCEPTION_MESSAGE_FIELD,
        EmValue, EmulationError, HeapObject, RuntimeHandle,
    },
    metadata::{
        module::FieldDef,
        token::{TableId, Token},
        typesig::TypeSig,
    },
    rewriter::intrinsics::RuntimeHelper,
    Error, Result,
};

/// Binary arithmetic and bitwise operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    And,
    Or,
    Xor,
}

/// Comparisons used by `ceq`/`cgt`/`clt` and the conditional branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl Machine {
    fn invalid_operand(instruction: &Instruction, expected: &'static str) -> Error {
        Error::Emulation(EmulationError::TypeMismatch {
            operation: instruction.mnemonic(),
            found: format!("operand {:?}, expected {expected}", instruction.operand),
        })
    }

    fn token_operand(instruction: &Instruction) -> Result<Token> {
        instruction
            .token()
            .ok_or_else(|| Self::invalid_operand(instruction, "token"))
    }

    /// Execute one instruction of `frame`.
    pub(super) fn step(&mut self, frame: &mut Frame, instruction: &Instruction) -> Result<StepResult> {
        if instruction.info.prefix == FE_PREFIX {
            return self.execute_fe_prefixed(frame, instruction);
        }

        match instruction.info.code {
            NOP => Ok(StepResult::Continue),

            LDARG_0 | LDARG_1 | LDARG_2 | LDARG_3 | LDARG_S => {
                let index = instruction
                    .argument_index()
                    .ok_or_else(|| Self::invalid_operand(instruction, "argument"))?;
                Self::load_argument(frame, index)
            }
            STARG_S => {
                let index = instruction
                    .argument_index()
                    .ok_or_else(|| Self::invalid_operand(instruction, "argument"))?;
                Self::store_argument(frame, index)
            }
            LDLOC_0 | LDLOC_1 | LDLOC_2 | LDLOC_3 | LDLOC_S => {
                let index = instruction
                    .local_index()
                    .ok_or_else(|| Self::invalid_operand(instruction, "local"))?;
                Self::load_local(frame, index)
            }
            STLOC_0 | STLOC_1 | STLOC_2 | STLOC_3 | STLOC_S => {
                let index = instruction
                    .local_index()
                    .ok_or_else(|| Self::invalid_operand(instruction, "local"))?;
                Self::store_local(frame, index)
            }

            LDNULL => {
                frame.push(EmValue::Null)?;
                Ok(StepResult::Continue)
            }
            LDC_I4_M1..=LDC_I4 => {
                let value = instruction
                    .constant_i4()
                    .ok_or_else(|| Self::invalid_operand(instruction, "int32"))?;
                frame.push(EmValue::I32(value))?;
                Ok(StepResult::Continue)
            }
            LDC_I8 => match instruction.operand {
                Operand::Immediate(Immediate::Int64(value)) => {
                    frame.push(EmValue::I64(value))?;
                    Ok(StepResult::Continue)
                }
                _ => Err(Self::invalid_operand(instruction, "int64")),
            },
            LDC_R8 => match instruction.operand {
                Operand::Immediate(Immediate::Float64(value)) => {
                    frame.push(EmValue::F64(value))?;
                    Ok(StepResult::Continue)
                }
                _ => Err(Self::invalid_operand(instruction, "float64")),
            },

            DUP => {
                let top = frame.peek()?.clone();
                frame.push(top)?;
                Ok(StepResult::Continue)
            }
            POP => {
                frame.pop()?;
                Ok(StepResult::Continue)
            }

            CALL => self.call(frame, instruction, false),
            CALLVIRT => self.call(frame, instruction, true),
            NEWOBJ => self.new_object_instruction(frame, instruction),
            RET => Self::return_from(frame),

            BR | BR_S => Self::jump(instruction),
            BRFALSE | BRFALSE_S => {
                let value = frame.pop()?;
                if value.is_truthy() {
                    Ok(StepResult::Continue)
                } else {
                    Self::jump(instruction)
                }
            }
            BRTRUE | BRTRUE_S => {
                let value = frame.pop()?;
                if value.is_truthy() {
                    Self::jump(instruction)
                } else {
                    Ok(StepResult::Continue)
                }
            }
            BEQ | BEQ_S => Self::branch_compare(frame, instruction, CompareOp::Eq),
            BGE | BGE_S => Self::branch_compare(frame, instruction, CompareOp::Ge),
            BGT | BGT_S => Self::branch_compare(frame, instruction, CompareOp::Gt),
            BLE | BLE_S => Self::branch_compare(frame, instruction, CompareOp::Le),
            BLT | BLT_S => Self::branch_compare(frame, instruction, CompareOp::Lt),
            BNE_UN | BNE_UN_S => Self::branch_compare(frame, instruction, CompareOp::Ne),

            ADD => Self::binary_op(frame, BinaryOp::Add),
            SUB => Self::binary_op(frame, BinaryOp::Sub),
            MUL => Self::binary_op(frame, BinaryOp::Mul),
            DIV => Self::binary_op(frame, BinaryOp::Div),
            REM => Self::binary_op(frame, BinaryOp::Rem),
            AND => Self::binary_op(frame, BinaryOp::And),
            OR => Self::binary_op(frame, BinaryOp::Or),
            XOR => Self::binary_op(frame, BinaryOp::Xor),
            NEG => Self::unary_op(frame, instruction),
            NOT => Self::unary_op(frame, instruction),
            CONV_I4 | CONV_I8 | CONV_R8 => Self::convert(frame, instruction),

            LDSTR => {
                let token = Self::token_operand(instruction)?;
                let value = self.module.user_string(token)?;
                frame.push(EmValue::string(value))?;
                Ok(StepResult::Continue)
            }
            CASTCLASS => self.cast(frame, instruction, false),
            ISINST => self.cast(frame, instruction, true),
            THROW => Self::throw(frame),

            LDFLD => self.load_field(frame, instruction),
            STFLD => self.store_field(frame, instruction),
            LDSFLD => self.load_static_field(frame, instruction),
            STSFLD => self.store_static_field(frame, instruction),

            BOX => {
                let ty = self.resolve_type(frame, Self::token_operand(instruction)?)?;
                let value = frame.pop()?;
                frame.push(value.box_as(&ty))?;
                Ok(StepResult::Continue)
            }
            UNBOX_ANY => {
                let ty = self.resolve_type(frame, Self::token_operand(instruction)?)?;
                let value = frame.pop()?;
                frame.push(value.unbox_to(&ty, self.module.as_ref())?)?;
                Ok(StepResult::Continue)
            }

            NEWARR => self.new_array(frame, instruction),
            LDLEN => {
                let array = frame.pop()?;
                let length = Self::object_of(&array)?.length()?;
                frame.push(EmValue::I32(i32::try_from(length).unwrap_or(i32::MAX)))?;
                Ok(StepResult::Continue)
            }
            LDELEM_REF => {
                let index = Self::index_of(&frame.pop()?)?;
                let array = frame.pop()?;
                let element = Self::object_of(&array)?.element(index)?;
                frame.push(element)?;
                Ok(StepResult::Continue)
            }
            STELEM_REF => {
                let value = frame.pop()?;
                let index = Self::index_of(&frame.pop()?)?;
                let array = frame.pop()?;
                Self::object_of(&array)?.set_element(index, value)?;
                Ok(StepResult::Continue)
            }

            LDTOKEN => self.load_token(frame, instruction),

            _ => Err(EmulationError::UnsupportedOpcode {
                mnemonic: instruction.mnemonic(),
                offset: instruction.offset,
            }
            .into()),
        }
    }

    fn execute_fe_prefixed(&mut self, frame: &mut Frame, instruction: &Instruction) -> Result<StepResult> {
        match instruction.info.code {
            FE_CEQ => Self::compare(frame, CompareOp::Eq),
            FE_CGT => Self::compare(frame, CompareOp::Gt),
            FE_CLT => Self::compare(frame, CompareOp::Lt),
            FE_LDARG => {
                let index = instruction
                    .argument_index()
                    .ok_or_else(|| Self::invalid_operand(instruction, "argument"))?;
                Self::load_argument(frame, index)
            }
            FE_STARG => {
                let index = instruction
                    .argument_index()
                    .ok_or_else(|| Self::invalid_operand(instruction, "argument"))?;
                Self::store_argument(frame, index)
            }
            FE_LDLOC => {
                let index = instruction
                    .local_index()
                    .ok_or_else(|| Self::invalid_operand(instruction, "local"))?;
                Self::load_local(frame, index)
            }
            FE_STLOC => {
                let index = instruction
                    .local_index()
                    .ok_or_else(|| Self::invalid_operand(instruction, "local"))?;
                Self::store_local(frame, index)
            }
            _ => Err(EmulationError::UnsupportedOpcode {
                mnemonic: instruction.mnemonic(),
                offset: instruction.offset,
            }
            .into()),
        }
    }

    fn load_argument(frame: &mut Frame, index: u16) -> Result<StepResult> {
        let index = usize::from(index);
        let value = frame
            .args
            .get(index)
            .cloned()
            .ok_or(EmulationError::ArgumentIndexOutOfBounds {
                index,
                count: frame.args.len(),
            })?;
        frame.push(value)?;
        Ok(StepResult::Continue)
    }

    fn store_argument(frame: &mut Frame, index: u16) -> Result<StepResult> {
        let index = usize::from(index);
        let value = frame.pop()?;
        let count = frame.args.len();
        let slot = frame
            .args
            .get_mut(index)
            .ok_or(EmulationError::ArgumentIndexOutOfBounds { index, count })?;
        *slot = value;
        Ok(StepResult::Continue)
    }

    fn load_local(frame: &mut Frame, index: u16) -> Result<StepResult> {
        let index = usize::from(index);
        let value = frame
            .locals
            .get(index)
            .cloned()
            .ok_or(EmulationError::LocalIndexOutOfBounds {
                index,
                count: frame.locals.len(),
            })?;
        frame.push(value)?;
        Ok(StepResult::Continue)
    }

    fn store_local(frame: &mut Frame, index: u16) -> Result<StepResult> {
        let index = usize::from(index);
        let value = frame.pop()?;
        let count = frame.locals.len();
        let slot = frame
            .locals
            .get_mut(index)
            .ok_or(EmulationError::LocalIndexOutOfBounds { index, count })?;
        *slot = value;
        Ok(StepResult::Continue)
    }

    fn jump(instruction: &Instruction) -> Result<StepResult> {
        instruction
            .branch_target()
            .map(StepResult::Branch)
            .ok_or_else(|| Self::invalid_operand(instruction, "branch target"))
    }

    fn return_from(frame: &mut Frame) -> Result<StepResult> {
        if frame.method.is_constructor() || frame.method.return_type == TypeSig::Void {
            return Ok(StepResult::Return(EmValue::Void));
        }
        let value = frame.pop()?;
        let ty = frame.close(&frame.method.return_type);
        Ok(StepResult::Return(value.coerce_to(&ty)))
    }

    fn evaluate(op: CompareOp, lhs: &EmValue, rhs: &EmValue) -> Result<bool> {
        let ordering = match (lhs, rhs) {
            (EmValue::F64(_), _) | (_, EmValue::F64(_)) => {
                let (Some(a), Some(b)) = (as_f64(lhs), as_f64(rhs)) else {
                    return Self::reference_compare(op, lhs, rhs);
                };
                a.partial_cmp(&b)
            }
            _ => match (lhs.as_i64(), rhs.as_i64()) {
                (Some(a), Some(b)) => Some(a.cmp(&b)),
                _ => return Self::reference_compare(op, lhs, rhs),
            },
        };

        Ok(match op {
            CompareOp::Eq => ordering == Some(Ordering::Equal),
            CompareOp::Ne => ordering != Some(Ordering::Equal),
            CompareOp::Gt => ordering == Some(Ordering::Greater),
            CompareOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
            CompareOp::Lt => ordering == Some(Ordering::Less),
            CompareOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        })
    }

    /// Equality of references; ordering them is an error.
    fn reference_compare(op: CompareOp, lhs: &EmValue, rhs: &EmValue) -> Result<bool> {
        match op {
            CompareOp::Eq => Ok(lhs == rhs),
            CompareOp::Ne => Ok(lhs != rhs),
            _ => Err(EmulationError::TypeMismatch {
                operation: "compare",
                found: format!("{lhs:?} and {rhs:?}"),
            }
            .into()),
        }
    }

    fn compare(frame: &mut Frame, op: CompareOp) -> Result<StepResult> {
        let rhs = frame.pop()?;
        let lhs = frame.pop()?;
        let result = Self::evaluate(op, &lhs, &rhs)?;
        frame.push(EmValue::I32(i32::from(result)))?;
        Ok(StepResult::Continue)
    }

    fn branch_compare(frame: &mut Frame, instruction: &Instruction, op: CompareOp) -> Result<StepResult> {
        let rhs = frame.pop()?;
        let lhs = frame.pop()?;
        if Self::evaluate(op, &lhs, &rhs)? {
            Self::jump(instruction)
        } else {
            Ok(StepResult::Continue)
        }
    }

    fn binary_op(frame: &mut Frame, op: BinaryOp) -> Result<StepResult> {
        let rhs = frame.pop()?;
        let lhs = frame.pop()?;
        let mismatch = || {
            Error::Emulation(EmulationError::TypeMismatch {
                operation: "arithmetic",
                found: format!("{lhs:?} and {rhs:?}"),
            })
        };

        let result = match (&lhs, &rhs) {
            (EmValue::F64(_), _) | (_, EmValue::F64(_)) => {
                let (Some(a), Some(b)) = (as_f64(&lhs), as_f64(&rhs)) else {
                    return Err(mismatch());
                };
                EmValue::F64(match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                    BinaryOp::Rem => a % b,
                    BinaryOp::And | BinaryOp::Or | BinaryOp::Xor => return Err(mismatch()),
                })
            }
            (EmValue::I64(_), _) | (_, EmValue::I64(_)) => {
                let (Some(a), Some(b)) = (lhs.as_i64(), rhs.as_i64()) else {
                    return Err(mismatch());
                };
                EmValue::I64(match op {
                    BinaryOp::Add => a.wrapping_add(b),
                    BinaryOp::Sub => a.wrapping_sub(b),
                    BinaryOp::Mul => a.wrapping_mul(b),
                    BinaryOp::Div | BinaryOp::Rem if b == 0 => {
                        return Err(EmulationError::DivisionByZero.into())
                    }
                    BinaryOp::Div => a.wrapping_div(b),
                    BinaryOp::Rem => a.wrapping_rem(b),
                    BinaryOp::And => a & b,
                    BinaryOp::Or => a | b,
                    BinaryOp::Xor => a ^ b,
                })
            }
            _ => {
                let (Some(a), Some(b)) = (lhs.as_i32(), rhs.as_i32()) else {
                    return Err(mismatch());
                };
                EmValue::I32(match op {
                    BinaryOp::Add => a.wrapping_add(b),
                    BinaryOp::Sub => a.wrapping_sub(b),
                    BinaryOp::Mul => a.wrapping_mul(b),
                    BinaryOp::Div | BinaryOp::Rem if b == 0 => {
                        return Err(EmulationError::DivisionByZero.into())
                    }
                    BinaryOp::Div => a.wrapping_div(b),
                    BinaryOp::Rem => a.wrapping_rem(b),
                    BinaryOp::And => a & b,
                    BinaryOp::Or => a | b,
                    BinaryOp::Xor => a ^ b,
                })
            }
        };

        frame.push(result)?;
        Ok(StepResult::Continue)
    }

    fn unary_op(frame: &mut Frame, instruction: &Instruction) -> Result<StepResult> {
        let value = frame.pop()?;
        let negate = instruction.info.code == NEG;
        let result = match value {
            EmValue::F64(v) if negate => EmValue::F64(-v),
            EmValue::I64(v) if negate => EmValue::I64(v.wrapping_neg()),
            EmValue::I64(v) => EmValue::I64(!v),
            other => match other.as_i32() {
                Some(v) if negate => EmValue::I32(v.wrapping_neg()),
                Some(v) => EmValue::I32(!v),
                None => {
                    return Err(EmulationError::TypeMismatch {
                        operation: instruction.mnemonic(),
                        found: format!("{other:?}"),
                    }
                    .into())
                }
            },
        };
        frame.push(result)?;
        Ok(StepResult::Continue)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn convert(frame: &mut Frame, instruction: &Instruction) -> Result<StepResult> {
        let value = frame.pop()?;
        let mismatch = || {
            Error::Emulation(EmulationError::TypeMismatch {
                operation: instruction.mnemonic(),
                found: format!("{value:?}"),
            })
        };

        let result = match instruction.info.code {
            CONV_I4 => EmValue::I32(match &value {
                EmValue::F64(v) => *v as i32,
                other => other.as_i64().ok_or_else(mismatch)? as i32,
            }),
            CONV_I8 => EmValue::I64(match &value {
                EmValue::F64(v) => *v as i64,
                other => other.as_i64().ok_or_else(mismatch)?,
            }),
            _ => EmValue::F64(as_f64(&value).ok_or_else(mismatch)?),
        };
        frame.push(result)?;
        Ok(StepResult::Continue)
    }

    fn throw(frame: &mut Frame) -> Result<StepResult> {
        let exception = frame.pop()?;
        let object = match &exception {
            EmValue::Null => return Err(EmulationError::NullReference.into()),
            EmValue::ObjectRef(object) => object,
            other => {
                return Err(EmulationError::UnhandledException {
                    type_name: other.type_sig().to_string(),
                    message: None,
                }
                .into())
            }
        };

        let message = object
            .field(EXCEPTION_MESSAGE_FIELD)?
            .and_then(|message| message.as_str().map(str::to_string));
        Err(EmulationError::UnhandledException {
            type_name: object.type_sig().to_string(),
            message,
        }
        .into())
    }

    fn call(&mut self, frame: &mut Frame, instruction: &Instruction, virtual_call: bool) -> Result<StepResult> {
        let method = self.resolve_method(frame, Self::token_operand(instruction)?)?;
        let args = frame
            .pop_n(method.parameters.len())?
            .into_iter()
            .zip(&method.parameters)
            .map(|(arg, ty)| arg.coerce_to(ty))
            .collect();
        let this = if method.has_this() {
            Some(frame.pop()?)
        } else {
            None
        };

        let result = self.dispatch(&method, this, args, virtual_call)?;
        if method.return_type != TypeSig::Void && !method.is_constructor() {
            frame.push(result.coerce_to(&method.return_type))?;
        }
        Ok(StepResult::Continue)
    }

    fn new_object_instruction(&mut self, frame: &mut Frame, instruction: &Instruction) -> Result<StepResult> {
        let ctor = self.resolve_method(frame, Self::token_operand(instruction)?)?;
        let args: Vec<EmValue> = frame
            .pop_n(ctor.parameters.len())?
            .into_iter()
            .zip(&ctor.parameters)
            .map(|(arg, ty)| arg.coerce_to(ty))
            .collect();

        if RuntimeHelper::identify(&ctor) == Some(RuntimeHelper::NewInvocationContext) {
            let context = self.run_helper(RuntimeHelper::NewInvocationContext, None, args)?;
            frame.push(context)?;
            return Ok(StepResult::Continue);
        }

        let object = EmValue::ObjectRef(HeapObject::instance(ctor.declaring_type.clone()));
        self.dispatch(&ctor, Some(object.clone()), args, false)?;
        frame.push(object)?;
        Ok(StepResult::Continue)
    }

    fn cast(&mut self, frame: &mut Frame, instruction: &Instruction, probe: bool) -> Result<StepResult> {
        let ty = self.resolve_type(frame, Self::token_operand(instruction)?)?;
        let value = frame.pop()?;
        if value.is_null() || ty.is_assignable_from(&value.type_sig(), self.module.as_ref()) {
            frame.push(value)?;
        } else if probe {
            frame.push(EmValue::Null)?;
        } else {
            return Err(EmulationError::InvalidCast {
                from: value.type_sig().to_string(),
                to: ty.to_string(),
            }
            .into());
        }
        Ok(StepResult::Continue)
    }

    fn field_def(&self, instruction: &Instruction) -> Result<(Token, FieldDef)> {
        let token = Self::token_operand(instruction)?;
        if !token.is_table(TableId::Field) {
            return Err(Self::invalid_operand(instruction, "field token"));
        }
        Ok((token, self.module.field(token)?.clone()))
    }

    fn load_field(&mut self, frame: &mut Frame, instruction: &Instruction) -> Result<StepResult> {
        let (_, def) = self.field_def(instruction)?;
        let target = frame.pop()?;
        let value = Self::object_of(&target)?
            .field(&def.name)?
            .unwrap_or_else(|| EmValue::default_for(&frame.close(&def.field_type)));
        frame.push(value)?;
        Ok(StepResult::Continue)
    }

    fn store_field(&mut self, frame: &mut Frame, instruction: &Instruction) -> Result<StepResult> {
        let (_, def) = self.field_def(instruction)?;
        let value = frame.pop()?;
        let target = frame.pop()?;
        let ty = frame.close(&def.field_type);
        Self::object_of(&target)?.set_field(&def.name, value.coerce_to(&ty))?;
        Ok(StepResult::Continue)
    }

    fn load_static_field(&mut self, frame: &mut Frame, instruction: &Instruction) -> Result<StepResult> {
        let (token, def) = self.field_def(instruction)?;
        let value = self
            .statics
            .get(&token)
            .cloned()
            .unwrap_or_else(|| EmValue::default_for(&def.field_type));
        frame.push(value)?;
        Ok(StepResult::Continue)
    }

    fn store_static_field(&mut self, frame: &mut Frame, instruction: &Instruction) -> Result<StepResult> {
        let (token, def) = self.field_def(instruction)?;
        let value = frame.pop()?;
        self.statics.insert(token, value.coerce_to(&def.field_type));
        Ok(StepResult::Continue)
    }

    fn new_array(&mut self, frame: &mut Frame, instruction: &Instruction) -> Result<StepResult> {
        let element = self.resolve_type(frame, Self::token_operand(instruction)?)?;
        let length = frame.pop()?;
        let length = length
            .as_i64()
            .and_then(|length| usize::try_from(length).ok())
            .ok_or_else(|| EmulationError::TypeMismatch {
                operation: "newarr",
                found: format!("length {length:?}"),
            })?;
        frame.push(EmValue::ObjectRef(HeapObject::array(element, length)))?;
        Ok(StepResult::Continue)
    }

    fn load_token(&mut self, frame: &mut Frame, instruction: &Instruction) -> Result<StepResult> {
        let token = Self::token_operand(instruction)?;
        let handle = match token.table_id() {
            Some(TableId::TypeDef | TableId::TypeSpec) => {
                RuntimeHandle::Type(self.resolve_type(frame, token)?)
            }
            Some(TableId::MethodDef | TableId::MemberRef | TableId::MethodSpec) => {
                RuntimeHandle::Method(Arc::new(self.resolve_method(frame, token)?))
            }
            _ => return Err(Self::invalid_operand(instruction, "type or method token")),
        };
        frame.push(EmValue::Handle(handle))?;
        Ok(StepResult::Continue)
    }

    fn object_of(value: &EmValue) -> Result<&Arc<HeapObject>> {
        match value {
            EmValue::ObjectRef(object) => Ok(object),
            EmValue::Null => Err(EmulationError::NullReference.into()),
            other => Err(EmulationError::TypeMismatch {
                operation: "object access",
                found: format!("{other:?}"),
            }
            .into()),
        }
    }

    fn index_of(value: &EmValue) -> Result<i64> {
        value.as_i64().ok_or_else(|| {
            EmulationError::TypeMismatch {
                operation: "array index",
                found: format!("{value:?}"),
            }
            .into()
        })
    }
}

#[allow(clippy::cast_precision_loss)]
fn as_f64(value: &EmValue) -> Option<f64> {
    match value {
        EmValue::F64(value) => Some(*value),
        other => other.as_i64().map(|value| value as f64),
    }
}
