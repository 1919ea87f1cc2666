//! The instruction set the translator understands.
//!
//! Opcodes are encoded as the first word of each instruction in
//! `Iseq::encoded`, followed by `Opcode::len() - 1` operand words.

macro_rules! opcodes {
    ($( $name:ident = $code:literal, $len:literal, $text:literal; )+) => {
        /// A bytecode opcode.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u64)]
        pub enum Opcode {
            $( $name = $code, )+
        }

        impl Opcode {
            /// Decode an encoded word into an opcode.
            pub fn from_word(word: u64) -> Option<Opcode> {
                match word {
                    $( $code => Some(Opcode::$name), )+
                    _ => None,
                }
            }

            /// Total instruction length in words, opcode included.
            pub const fn len(self) -> usize {
                match self {
                    $( Opcode::$name => $len, )+
                }
            }

            /// Bytecode-level name, as used in emitted label comments.
            pub const fn name(self) -> &'static str {
                match self {
                    $( Opcode::$name => $text, )+
                }
            }
        }
    };
}

opcodes! {
    Nop = 0, 1, "nop";
    GetLocal = 1, 3, "getlocal";
    SetLocal = 2, 3, "setlocal";
    GetSpecial = 3, 3, "getspecial";
    SetSpecial = 4, 2, "setspecial";
    GetInstanceVariable = 5, 3, "getinstancevariable";
    SetInstanceVariable = 6, 3, "setinstancevariable";
    GetClassVariable = 7, 2, "getclassvariable";
    SetClassVariable = 8, 2, "setclassvariable";
    GetConstant = 9, 2, "getconstant";
    SetConstant = 10, 2, "setconstant";
    GetGlobal = 11, 2, "getglobal";
    SetGlobal = 12, 2, "setglobal";
    PutNil = 13, 1, "putnil";
    PutSelf = 14, 1, "putself";
    PutObject = 15, 2, "putobject";
    PutSpecialObject = 16, 2, "putspecialobject";
    PutIseq = 17, 2, "putiseq";
    PutString = 18, 2, "putstring";
    ConcatStrings = 19, 2, "concatstrings";
    ToString = 20, 1, "tostring";
    FreezeString = 21, 2, "freezestring";
    ToRegexp = 22, 3, "toregexp";
    Intern = 23, 1, "intern";
    NewArray = 24, 2, "newarray";
    DupArray = 25, 2, "duparray";
    ExpandArray = 26, 3, "expandarray";
    ConcatArray = 27, 1, "concatarray";
    SplatArray = 28, 2, "splatarray";
    NewHash = 29, 2, "newhash";
    NewRange = 30, 2, "newrange";
    Pop = 31, 1, "pop";
    Dup = 32, 1, "dup";
    DupN = 33, 2, "dupn";
    Swap = 34, 1, "swap";
    Reverse = 35, 2, "reverse";
    Reput = 36, 1, "reput";
    TopN = 37, 2, "topn";
    SetN = 38, 2, "setn";
    AdjustStack = 39, 2, "adjuststack";
    Defined = 40, 4, "defined";
    CheckMatch = 41, 2, "checkmatch";
    CheckKeyword = 42, 3, "checkkeyword";
    Trace = 43, 2, "trace";
    Trace2 = 44, 3, "trace2";
    DefineClass = 45, 4, "defineclass";
    Send = 46, 4, "send";
    OptStrFreeze = 47, 2, "opt_str_freeze";
    OptStrUminus = 48, 2, "opt_str_uminus";
    OptNewArrayMax = 49, 2, "opt_newarray_max";
    OptNewArrayMin = 50, 2, "opt_newarray_min";
    OptSendWithoutBlock = 51, 3, "opt_send_without_block";
    InvokeSuper = 52, 4, "invokesuper";
    InvokeBlock = 53, 2, "invokeblock";
    Leave = 54, 1, "leave";
    Throw = 55, 2, "throw";
    Jump = 56, 2, "jump";
    BranchIf = 57, 2, "branchif";
    BranchUnless = 58, 2, "branchunless";
    BranchNil = 59, 2, "branchnil";
    BranchIfType = 60, 3, "branchiftype";
    GetInlineCache = 61, 3, "getinlinecache";
    SetInlineCache = 62, 2, "setinlinecache";
    Once = 63, 3, "once";
    OptCaseDispatch = 64, 3, "opt_case_dispatch";
    OptPlus = 65, 3, "opt_plus";
    OptMinus = 66, 3, "opt_minus";
    OptMult = 67, 3, "opt_mult";
    OptDiv = 68, 3, "opt_div";
    OptMod = 69, 3, "opt_mod";
    OptEq = 70, 3, "opt_eq";
    OptNeq = 71, 5, "opt_neq";
    OptLt = 72, 3, "opt_lt";
    OptLe = 73, 3, "opt_le";
    OptGt = 74, 3, "opt_gt";
    OptGe = 75, 3, "opt_ge";
    OptLtlt = 76, 3, "opt_ltlt";
    OptAref = 77, 3, "opt_aref";
    OptAset = 78, 3, "opt_aset";
    OptAsetWith = 79, 4, "opt_aset_with";
    OptArefWith = 80, 4, "opt_aref_with";
    OptLength = 81, 3, "opt_length";
    OptSize = 82, 3, "opt_size";
    OptEmptyP = 83, 3, "opt_empty_p";
    OptSucc = 84, 3, "opt_succ";
    OptNot = 85, 3, "opt_not";
    OptRegexpMatch1 = 86, 2, "opt_regexpmatch1";
    OptRegexpMatch2 = 87, 3, "opt_regexpmatch2";
    GetLocalWc0 = 88, 2, "getlocal_wc_0";
    GetLocalWc1 = 89, 2, "getlocal_wc_1";
    SetLocalWc0 = 90, 2, "setlocal_wc_0";
    SetLocalWc1 = 91, 2, "setlocal_wc_1";
    PutObjectFix0 = 92, 1, "putobject_fix_0";
    PutObjectFix1 = 93, 1, "putobject_fix_1";
}

/// Number of distinct opcodes.
pub const OPCODE_COUNT: u64 = 94;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_roundtrip() {
        for word in 0..OPCODE_COUNT {
            let op = Opcode::from_word(word).expect("every word below OPCODE_COUNT decodes");
            assert_eq!(op as u64, word);
            assert!(op.len() >= 1 && op.len() <= 5);
            assert!(!op.name().is_empty());
        }
        assert_eq!(Opcode::from_word(OPCODE_COUNT), None);
        assert_eq!(Opcode::from_word(u64::MAX), None);
    }

    #[test]
    fn operand_counts() {
        assert_eq!(Opcode::PutObject.len(), 2);
        assert_eq!(Opcode::Send.len(), 4);
        assert_eq!(Opcode::OptNeq.len(), 5);
        assert_eq!(Opcode::Leave.len(), 1);
        assert_eq!(Opcode::GetInlineCache.len(), 3);
    }
}
