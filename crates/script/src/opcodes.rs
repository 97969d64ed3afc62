//! Opcode constants and a tolerant script tokenizer.

pub const OP_0: u8 = 0x00;
pub const OP_PUSHDATA1: u8 = 0x4c;
pub const OP_PUSHDATA2: u8 = 0x4d;
pub const OP_PUSHDATA4: u8 = 0x4e;
pub const OP_1NEGATE: u8 = 0x4f;
pub const OP_1: u8 = 0x51;
pub const OP_16: u8 = 0x60;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_DUP: u8 = 0x76;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_CHECKSIGVERIFY: u8 = 0xad;
pub const OP_CHECKMULTISIG: u8 = 0xae;
pub const OP_CHECKMULTISIGVERIFY: u8 = 0xaf;

/// Scripts longer than this can never be executed.
pub const MAX_SCRIPT_SIZE: usize = 10_000;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Instruction<'a> {
    pub opcode: u8,
    /// Pushed bytes for push opcodes, empty otherwise.
    pub data: &'a [u8],
}

/// Iterates the instructions of a script, stopping at the first truncated push.
pub struct Instructions<'a> {
    script: &'a [u8],
    cursor: usize,
    truncated: bool,
}

impl<'a> Instructions<'a> {
    pub fn new(script: &'a [u8]) -> Self {
        Self {
            script,
            cursor: 0,
            truncated: false,
        }
    }

    /// True once iteration stopped on a push that runs past the end.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = match self.cursor.checked_add(len) {
            Some(end) if end <= self.script.len() => end,
            _ => {
                self.truncated = true;
                return None;
            }
        };
        let out = &self.script[self.cursor..end];
        self.cursor = end;
        Some(out)
    }
}

impl<'a> Iterator for Instructions<'a> {
    type Item = Instruction<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.truncated {
            return None;
        }
        let opcode = *self.script.get(self.cursor)?;
        self.cursor += 1;
        let len = match opcode {
            0x01..=0x4b => opcode as usize,
            OP_PUSHDATA1 => self.take(1)?[0] as usize,
            OP_PUSHDATA2 => {
                let bytes = self.take(2)?;
                u16::from_le_bytes([bytes[0], bytes[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let bytes = self.take(4)?;
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
            }
            _ => 0,
        };
        let data = if len > 0 { self.take(len)? } else { &[] };
        Some(Instruction { opcode, data })
    }
}

/// Decodes OP_1..OP_16 into their small integer value.
pub fn decode_op_n(opcode: u8) -> Option<u32> {
    match opcode {
        OP_0 => Some(0),
        OP_1..=OP_16 => Some(u32::from(opcode - OP_1 + 1)),
        _ => None,
    }
}

pub fn is_push_only(script: &[u8]) -> bool {
    let mut instructions = Instructions::new(script);
    for instruction in instructions.by_ref() {
        if instruction.opcode > OP_16 {
            return false;
        }
    }
    !instructions.is_truncated()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_reads_pushes() {
        let script = [0x02, 0xaa, 0xbb, OP_PUSHDATA1, 0x01, 0xcc, OP_CHECKSIG];
        let ops: Vec<_> = Instructions::new(&script).collect();
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[0].data, &[0xaa, 0xbb]);
        assert_eq!(ops[1].data, &[0xcc]);
        assert_eq!(ops[2].opcode, OP_CHECKSIG);
    }

    #[test]
    fn truncated_push_stops_iteration() {
        let script = [OP_CHECKSIG, 0x05, 0x01];
        assert_eq!(Instructions::new(&script).count(), 1);
        assert!(!is_push_only(&[0x05, 0x01]));
        assert!(!is_push_only(&[0x05]));
        assert!(is_push_only(&[0x01, 0x01, OP_1, OP_16]));
        assert!(!is_push_only(&[0x01, 0x01, OP_DUP]));
    }
}
