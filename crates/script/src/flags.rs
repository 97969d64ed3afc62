//! Script verification flags.

pub type ScriptFlags = u32;

pub const SCRIPT_VERIFY_NONE: ScriptFlags = 0;
/// Evaluate P2SH subscripts (BIP16).
pub const SCRIPT_VERIFY_P2SH: ScriptFlags = 1 << 0;
pub const SCRIPT_VERIFY_STRICTENC: ScriptFlags = 1 << 1;
/// Enforce strict DER signatures (BIP66).
pub const SCRIPT_VERIFY_DERSIG: ScriptFlags = 1 << 2;
pub const SCRIPT_VERIFY_LOW_S: ScriptFlags = 1 << 3;
pub const SCRIPT_VERIFY_NULLDUMMY: ScriptFlags = 1 << 4;
pub const SCRIPT_VERIFY_SIGPUSHONLY: ScriptFlags = 1 << 5;
pub const SCRIPT_VERIFY_MINIMALDATA: ScriptFlags = 1 << 6;
pub const SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS: ScriptFlags = 1 << 7;
pub const SCRIPT_VERIFY_CLEANSTACK: ScriptFlags = 1 << 8;
/// OP_CHECKLOCKTIMEVERIFY (BIP65).
pub const SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY: ScriptFlags = 1 << 9;
/// OP_CHECKSEQUENCEVERIFY (BIP112).
pub const SCRIPT_VERIFY_CHECKSEQUENCEVERIFY: ScriptFlags = 1 << 10;

/// Failing any of these makes a block invalid.
pub const MANDATORY_SCRIPT_VERIFY_FLAGS: ScriptFlags = SCRIPT_VERIFY_P2SH;

pub const STANDARD_SCRIPT_VERIFY_FLAGS: ScriptFlags = MANDATORY_SCRIPT_VERIFY_FLAGS
    | SCRIPT_VERIFY_DERSIG
    | SCRIPT_VERIFY_STRICTENC
    | SCRIPT_VERIFY_MINIMALDATA
    | SCRIPT_VERIFY_NULLDUMMY
    | SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS
    | SCRIPT_VERIFY_CLEANSTACK
    | SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY
    | SCRIPT_VERIFY_CHECKSEQUENCEVERIFY
    | SCRIPT_VERIFY_LOW_S;

pub const STANDARD_NOT_MANDATORY_VERIFY_FLAGS: ScriptFlags =
    STANDARD_SCRIPT_VERIFY_FLAGS & !MANDATORY_SCRIPT_VERIFY_FLAGS;

pub fn describe(flags: ScriptFlags) -> String {
    const NAMES: [(ScriptFlags, &str); 11] = [
        (SCRIPT_VERIFY_P2SH, "P2SH"),
        (SCRIPT_VERIFY_STRICTENC, "STRICTENC"),
        (SCRIPT_VERIFY_DERSIG, "DERSIG"),
        (SCRIPT_VERIFY_LOW_S, "LOW_S"),
        (SCRIPT_VERIFY_NULLDUMMY, "NULLDUMMY"),
        (SCRIPT_VERIFY_SIGPUSHONLY, "SIGPUSHONLY"),
        (SCRIPT_VERIFY_MINIMALDATA, "MINIMALDATA"),
        (SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS, "DISCOURAGE_UPGRADABLE_NOPS"),
        (SCRIPT_VERIFY_CLEANSTACK, "CLEANSTACK"),
        (SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY, "CHECKLOCKTIMEVERIFY"),
        (SCRIPT_VERIFY_CHECKSEQUENCEVERIFY, "CHECKSEQUENCEVERIFY"),
    ];
    let names: Vec<&str> = NAMES
        .iter()
        .filter(|(bit, _)| flags & bit != 0)
        .map(|(_, name)| *name)
        .collect();
    if names.is_empty() {
        "NONE".to_string()
    } else {
        names.join(",")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_lists_set_flags() {
        assert_eq!(describe(SCRIPT_VERIFY_NONE), "NONE");
        assert_eq!(
            describe(SCRIPT_VERIFY_P2SH | SCRIPT_VERIFY_CHECKSEQUENCEVERIFY),
            "P2SH,CHECKSEQUENCEVERIFY"
        );
        assert_eq!(STANDARD_NOT_MANDATORY_VERIFY_FLAGS & SCRIPT_VERIFY_P2SH, 0);
    }
}
