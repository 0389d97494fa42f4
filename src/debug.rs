// File: src/debug.rs
//
// Bytecode disassembler. Produces the classic listing (offset, source line
// or `|`, opcode, operand, resolved constant) as a string so callers can
// route it to stderr or assert on it in tests. Driven by the
// FLINT_PRINT_CODE and FLINT_TRACE_EXEC switches.

use crate::bytecode::{Chunk, OpCode};
use crate::value::Value;

pub fn disassemble_chunk(chunk: &Chunk, name: &str) -> String {
    let mut out = format!("== {} ==\n", name);
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = write_instruction(&mut out, chunk, offset);
    }
    out
}

/// One instruction's listing, newline-terminated.
pub fn disassemble_instruction(chunk: &Chunk, offset: usize) -> String {
    let mut out = String::new();
    write_instruction(&mut out, chunk, offset);
    out
}

fn write_instruction(out: &mut String, chunk: &Chunk, offset: usize) -> usize {
    out.push_str(&format!("{:04} ", offset));
    if offset > 0 && !chunk.is_line_start(offset) {
        out.push_str("   | ");
    } else {
        out.push_str(&format!("{:4} ", chunk.line_of(offset)));
    }

    let byte = chunk.code[offset];
    let Ok(op) = OpCode::try_from(byte) else {
        out.push_str(&format!("Unknown opcode {}\n", byte));
        return offset + 1;
    };

    match op {
        OpCode::Constant
        | OpCode::GetGlobal
        | OpCode::DefineGlobal
        | OpCode::SetGlobal => constant_instruction(out, chunk, op, offset),
        OpCode::ConstantLong => constant_long_instruction(out, chunk, offset),
        OpCode::GetLocal
        | OpCode::SetLocal
        | OpCode::GetUpvalue
        | OpCode::SetUpvalue
        | OpCode::Call => byte_instruction(out, chunk, op, offset),
        OpCode::Jump | OpCode::JumpIfFalse | OpCode::Case => {
            jump_instruction(out, chunk, op, 1, offset)
        }
        OpCode::Loop => jump_instruction(out, chunk, op, -1, offset),
        OpCode::Closure => closure_instruction(out, chunk, offset),
        _ => {
            out.push_str(&format!("{:?}\n", op));
            offset + 1
        }
    }
}

fn constant_instruction(out: &mut String, chunk: &Chunk, op: OpCode, offset: usize) -> usize {
    let index = chunk.code[offset + 1] as usize;
    out.push_str(&format!("{:<16} {:4} '{}'\n", format!("{:?}", op), index, chunk.constants[index]));
    offset + 2
}

fn constant_long_instruction(out: &mut String, chunk: &Chunk, offset: usize) -> usize {
    let index = chunk.code[offset + 1] as usize
        | (chunk.code[offset + 2] as usize) << 8
        | (chunk.code[offset + 3] as usize) << 16;
    out.push_str(&format!("{:<16} {:4} '{}'\n", "ConstantLong", index, chunk.constants[index]));
    offset + 4
}

fn byte_instruction(out: &mut String, chunk: &Chunk, op: OpCode, offset: usize) -> usize {
    let operand = chunk.code[offset + 1];
    out.push_str(&format!("{:<16} {:4}\n", format!("{:?}", op), operand));
    offset + 2
}

fn jump_instruction(
    out: &mut String,
    chunk: &Chunk,
    op: OpCode,
    sign: isize,
    offset: usize,
) -> usize {
    let jump = u16::from_be_bytes([chunk.code[offset + 1], chunk.code[offset + 2]]) as isize;
    let target = offset as isize + 3 + sign * jump;
    out.push_str(&format!("{:<16} {:4} -> {}\n", format!("{:?}", op), offset, target));
    offset + 3
}

fn closure_instruction(out: &mut String, chunk: &Chunk, offset: usize) -> usize {
    let index = chunk.code[offset + 1] as usize;
    let constant = chunk.constants[index];
    out.push_str(&format!("{:<16} {:4} {}\n", "Closure", index, constant));

    let mut offset = offset + 2;
    if let Value::Obj(function) = constant {
        for _ in 0..function.as_function().upvalue_count {
            let is_local = chunk.code[offset] != 0;
            let slot = chunk.code[offset + 1];
            let kind = if is_local { "local" } else { "upvalue" };
            out.push_str(&format!("{:04}    |                     {} {}\n", offset, kind, slot));
            offset += 2;
        }
    }
    offset
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_simple_and_constant_instructions() {
        let mut chunk = Chunk::new();
        chunk.write_constant(Value::Number(1.5), 1);
        chunk.write_op(OpCode::Negate, 1);
        chunk.write_op(OpCode::Return, 2);

        let listing = disassemble_chunk(&chunk, "test");
        assert!(listing.starts_with("== test ==\n"));
        assert!(listing.contains("Constant"));
        assert!(listing.contains("'1.5'"));
        assert!(listing.contains("Negate"));
        assert!(listing.contains("Return"));
    }

    #[test]
    fn continuation_lines_show_a_pipe() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::Nil, 3);
        chunk.write_op(OpCode::Pop, 3);
        let listing = disassemble_chunk(&chunk, "t");
        let lines: Vec<&str> = listing.lines().collect();
        assert!(lines[1].contains("   3 "));
        assert!(lines[2].contains("   | "));
    }

    #[test]
    fn jump_targets_are_resolved() {
        let mut chunk = Chunk::new();
        chunk.write_op(OpCode::JumpIfFalse, 1);
        chunk.write(0, 1);
        chunk.write(2, 1);
        chunk.write_op(OpCode::Nil, 1);
        chunk.write_op(OpCode::Pop, 1);

        let listing = disassemble_instruction(&chunk, 0);
        assert!(listing.contains("JumpIfFalse"));
        assert!(listing.contains("-> 5"));
    }
}
