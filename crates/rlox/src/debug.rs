//! Chunk disassembler.
//!
//! Renders compiled chunks one instruction per line: byte offset, source
//! line (`|` when unchanged from the previous instruction), opcode name, and
//! operand detail. Constants print the way `print` would show them.

use crate::{
    bytecode::{chunk::Chunk, op::Opcode},
    heap::Heap,
    value::value_to_string,
};

/// Disassembles a whole chunk under a header.
pub(crate) fn disassemble_chunk(heap: &Heap, chunk: &Chunk, name: &str) -> String {
    let mut out = format!("== {name} ==\n");
    let mut offset = 0;
    while offset < chunk.code.len() {
        offset = disassemble_instruction(heap, chunk, offset, &mut out);
    }
    out
}

/// Appends one rendered instruction to `out`, returning the next offset.
pub(crate) fn disassemble_instruction(heap: &Heap, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    out.push_str(&format!("{offset:04} "));
    if offset > 0 && chunk.lines[offset] == chunk.lines[offset - 1] {
        out.push_str("   | ");
    } else {
        out.push_str(&format!("{:4} ", chunk.lines[offset]));
    }

    let Some(op) = Opcode::from_repr(chunk.code[offset]) else {
        out.push_str(&format!("Unknown opcode {}\n", chunk.code[offset]));
        return offset + 1;
    };

    match op {
        Opcode::Constant
        | Opcode::GetGlobal
        | Opcode::DefineGlobal
        | Opcode::SetGlobal
        | Opcode::GetProperty
        | Opcode::SetProperty
        | Opcode::GetSuper
        | Opcode::Class
        | Opcode::Method => constant_instruction(heap, chunk, op, offset, out),
        Opcode::GetLocal | Opcode::SetLocal | Opcode::GetUpvalue | Opcode::SetUpvalue | Opcode::Call => {
            byte_instruction(chunk, op, offset, out)
        }
        Opcode::Jump | Opcode::JumpIfFalse => jump_instruction(chunk, op, 1, offset, out),
        Opcode::Loop => jump_instruction(chunk, op, -1, offset, out),
        Opcode::Invoke | Opcode::SuperInvoke => invoke_instruction(heap, chunk, op, offset, out),
        Opcode::Closure => closure_instruction(heap, chunk, offset, out),
        _ => {
            out.push_str(op.name());
            out.push('\n');
            offset + 1
        }
    }
}

fn constant_instruction(heap: &Heap, chunk: &Chunk, op: Opcode, offset: usize, out: &mut String) -> usize {
    let constant = chunk.code[offset + 1];
    let rendered = value_to_string(heap, chunk.constants[constant as usize]);
    out.push_str(&format!("{:<16} {constant:4} '{rendered}'\n", op.name()));
    offset + 2
}

fn byte_instruction(chunk: &Chunk, op: Opcode, offset: usize, out: &mut String) -> usize {
    let slot = chunk.code[offset + 1];
    out.push_str(&format!("{:<16} {slot:4}\n", op.name()));
    offset + 2
}

fn jump_instruction(chunk: &Chunk, op: Opcode, sign: i64, offset: usize, out: &mut String) -> usize {
    let jump = i64::from(chunk.read_u16(offset + 1));
    let target = offset as i64 + 3 + sign * jump;
    out.push_str(&format!("{:<16} {offset:4} -> {target}\n", op.name()));
    offset + 3
}

fn invoke_instruction(heap: &Heap, chunk: &Chunk, op: Opcode, offset: usize, out: &mut String) -> usize {
    let constant = chunk.code[offset + 1];
    let arg_count = chunk.code[offset + 2];
    let rendered = value_to_string(heap, chunk.constants[constant as usize]);
    out.push_str(&format!("{:<16} ({arg_count} args) {constant:4} '{rendered}'\n", op.name()));
    offset + 3
}

fn closure_instruction(heap: &Heap, chunk: &Chunk, offset: usize, out: &mut String) -> usize {
    let constant = chunk.code[offset + 1];
    let function_value = chunk.constants[constant as usize];
    let rendered = value_to_string(heap, function_value);
    out.push_str(&format!("{:<16} {constant:4} {rendered}\n", Opcode::Closure.name()));

    let crate::value::Value::Obj(function_id) = function_value else {
        return offset + 2;
    };
    let upvalue_count = heap.function(function_id).upvalue_count as usize;
    let mut next = offset + 2;
    for _ in 0..upvalue_count {
        let is_local = chunk.code[next] != 0;
        let index = chunk.code[next + 1];
        out.push_str(&format!(
            "{:04}      |                     {} {index}\n",
            next,
            if is_local { "local" } else { "upvalue" }
        ));
        next += 2;
    }
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{bytecode::compiler::compile, table::Table};

    fn disassemble(source: &str) -> (String, Heap) {
        let mut heap = Heap::new();
        let mut strings = Table::new();
        let function = compile(source, &mut heap, &mut strings).expect("source should compile");
        let text = disassemble_chunk(&heap, &heap.function(function).chunk, "script");
        (text, heap)
    }

    #[test]
    fn renders_constants_and_simple_ops() {
        let (text, _heap) = disassemble("1 + 2;");
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "== script ==");
        assert!(lines[1].contains("Constant") && lines[1].contains("'1'"));
        assert!(lines[2].contains("Constant") && lines[2].contains("'2'"));
        assert!(lines[3].contains("Add"));
        assert!(lines[4].contains("Pop"));
    }

    #[test]
    fn repeated_lines_render_as_bar() {
        let (text, _heap) = disassemble("1;\n2;");
        let lines: Vec<&str> = text.lines().collect();
        // Offset 0000 shows line 1; the Pop on the same line shows '|'.
        assert!(lines[1].contains("   1 "));
        assert!(lines[2].contains("   | "));
    }

    #[test]
    fn jumps_show_their_target() {
        let (text, _heap) = disassemble("if (true) 1;");
        assert!(text.lines().any(|l| l.contains("JumpIfFalse") && l.contains("->")));
    }

    #[test]
    fn closures_render_upvalue_descriptors() {
        let (text, _heap) = disassemble("fun outer() { var x = 1; fun inner() { return x; } }");
        assert!(text.contains("Closure"));
        // The inner chunk is what carries the upvalue; the outer script
        // chunk renders the outer closure with no descriptors.
        assert!(text.lines().any(|l| l.contains("Closure") && l.contains("<fn outer>")));
    }

    #[test]
    fn every_opcode_is_labelled_with_its_own_name() {
        let (text, _heap) = disassemble("var x = false; var y = true; var z = nil;");
        assert!(text.contains("False"));
        assert!(text.contains("True"));
        assert!(text.contains("Nil"));
        // No label borrows another opcode's name.
        for line in text.lines().skip(1) {
            assert!(!line.contains("Unknown opcode"), "line: {line}");
        }
    }
}
