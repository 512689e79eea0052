// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Evaluation of the unwinding expressions in STACK CFI and STACK WIN
//! records, recovering the caller's registers from the callee's.
//!
//! # STACK CFI
//!
//! A rule set maps register names to postfix expressions:
//!
//! `.cfa: $esp 4 + .ra: .cfa 4 - ^ $ebp: .cfa 8 - ^`
//!
//! `.cfa` is the canonical frame address, the caller's stack pointer from
//! before the call. It must be computed first: every other rule may use
//! its value. `.ra` is the return address. Both must be present. All other
//! names are general-purpose registers; a name on the left denotes the
//! caller's register, a name inside an expression reads the callee's.
//! Registers without a rule are simply absent from the output (omission
//! means "unchanged" to the stackwalker, following GCC practice).
//!
//! # STACK WIN program strings
//!
//! Program strings use the same postfix expression language plus an
//! assignment operator, operating on a dictionary of variables:
//!
//! `$T0 $ebp = $eip $T0 4 + ^ = $ebp $T0 ^ = $esp $T0 8 + =`
//!
//! The dictionary starts out holding the callee's `$esp`/`$ebp` (and
//! `$ebx` when known) and a handful of constants describing the frame
//! layout (`.cbParams`, `.cbSavedRegs`, `.cbLocals`, `.cbCalleeParams`,
//! `.raSearch`, `.raSearchStart`). After evaluation the caller's registers
//! are read back out of `$eip`, `$esp`, `$ebp`, `$ebx`, `$esi` and `$edi`.
//!
//! # Expressions
//!
//! Postfix (reverse Polish) notation, whitespace-separated. Values are
//! pushed; operators pop their operands and push their result:
//!
//! * `+ - * / %`: wrapping binary arithmetic (division by zero fails);
//! * `@`: binary align, truncating the left operand to a multiple of the
//!   (power of two) right operand;
//! * `^`: unary dereference through the caller-supplied memory;
//! * `=`: binary assign (STACK WIN only; the left operand must be a
//!   variable name);
//! * integer literals, decimal or `0x` hex, within i64;
//! * `.undef`: an explicitly unknown value.
//!
//! Evaluation is bounded by the token count and fails on stack underflow,
//! failed memory reads, undefined registers, or unknown tokens. A failure
//! discards the whole register recovery; no partial result escapes.

use std::collections::HashMap;
use std::str::FromStr;

use tracing::{debug, trace};

use super::types::{WinStackThing, WindowsFrameInfo};

/// A machine word the evaluators can compute with.
///
/// The expression language is identical for 32-bit and 64-bit targets, so
/// the evaluator is generic over the word type rather than duplicated.
pub trait RegisterValue: Copy + PartialEq + std::fmt::Debug {
    /// The size of this word in bytes.
    const BYTES: usize;
    /// Truncate a u64 to this width.
    fn from_u64(v: u64) -> Self;
    fn to_u64(self) -> u64;
}

impl RegisterValue for u32 {
    const BYTES: usize = 4;
    fn from_u64(v: u64) -> u32 {
        v as u32
    }
    fn to_u64(self) -> u64 {
        self as u64
    }
}

impl RegisterValue for u64 {
    const BYTES: usize = 8;
    fn from_u64(v: u64) -> u64 {
        v
    }
    fn to_u64(self) -> u64 {
        self
    }
}

/// Read-only memory the evaluators may dereference, usually the stack
/// contents captured in a minidump.
pub trait MemoryRegion {
    /// Read `size` bytes at `address` as a little-endian integer, or
    /// `None` if the address range isn't mapped.
    fn get_memory_at_address(&self, address: u64, size: usize) -> Option<u64>;
}

/// A register name to value mapping, keyed the way names appear in the
/// symbol file (`$esp`, `x11`, `.cfa`, ...).
pub type RegisterValueMap<V> = HashMap<String, V>;

/// The unwind rules in effect at one address, assembled from a STACK CFI
/// INIT record and the deltas preceding the address.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CfiFrameInfo {
    /// The rule computing the canonical frame address.
    pub cfa_rule: String,
    /// The rule computing the return address.
    pub ra_rule: String,
    /// Rules for the other registers, by name.
    pub register_rules: HashMap<String, String>,
}

pub const CFA_RULE_NAME: &str = ".cfa";
pub const RA_RULE_NAME: &str = ".ra";

impl CfiFrameInfo {
    /// Compute the caller's registers from the callee's.
    ///
    /// The result holds `.cfa`, `.ra` and every register with a rule. If
    /// any rule fails to evaluate, the whole recovery fails.
    pub fn find_caller_regs<V: RegisterValue>(
        &self,
        callee_regs: &RegisterValueMap<V>,
        memory: &dyn MemoryRegion,
    ) -> Option<RegisterValueMap<V>> {
        if self.cfa_rule.is_empty() || self.ra_rule.is_empty() {
            debug!("CFI rules are missing .cfa or .ra");
            return None;
        }

        // The CFA has to go first: the other rules may read it, and it
        // cannot read itself.
        let cfa = eval_cfi_expr(&self.cfa_rule, callee_regs, None, memory)?;
        let ra = eval_cfi_expr(&self.ra_rule, callee_regs, Some(cfa), memory)?;

        let mut caller_regs = RegisterValueMap::new();
        caller_regs.insert(CFA_RULE_NAME.to_string(), cfa);
        caller_regs.insert(RA_RULE_NAME.to_string(), ra);
        for (reg, expr) in &self.register_rules {
            let value = eval_cfi_expr(expr, callee_regs, Some(cfa), memory)?;
            caller_regs.insert(reg.clone(), value);
        }
        Some(caller_regs)
    }
}

/// Evaluate a single CFI expression to the one value left on the stack.
fn eval_cfi_expr<V: RegisterValue>(
    expr: &str,
    callee_regs: &RegisterValueMap<V>,
    cfa: Option<V>,
    memory: &dyn MemoryRegion,
) -> Option<V> {
    let mut stack: Vec<V> = Vec::new();
    for tok in expr.split_ascii_whitespace() {
        match tok {
            "+" | "-" | "*" | "/" | "%" | "@" => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?;
                stack.push(binop(tok, lhs, rhs)?);
            }
            "^" => {
                let ptr = stack.pop()?;
                let word = memory.get_memory_at_address(ptr.to_u64(), V::BYTES)?;
                stack.push(V::from_u64(word));
            }
            ".cfa" => {
                // Absent while the CFA's own rule is being computed.
                stack.push(cfa?);
            }
            ".undef" => {
                // The value is explicitly unknown.
                return None;
            }
            _ => {
                if let Some(&val) = callee_regs.get(tok) {
                    stack.push(val);
                } else if let Some(val) = parse_literal(tok) {
                    stack.push(val);
                } else {
                    trace!("CFI expression eval failed on token: {}", tok);
                    return None;
                }
            }
        }
    }
    if stack.len() == 1 {
        stack.pop()
    } else {
        None
    }
}

/// Apply a binary arithmetic operator, wrapping at the word width.
fn binop<V: RegisterValue>(op: &str, lhs: V, rhs: V) -> Option<V> {
    let (lhs, rhs) = (lhs.to_u64(), rhs.to_u64());
    let result = match op {
        "+" => lhs.wrapping_add(rhs),
        "-" => lhs.wrapping_sub(rhs),
        "*" => lhs.wrapping_mul(rhs),
        "/" => {
            if rhs == 0 {
                return None;
            }
            lhs.wrapping_div(rhs)
        }
        "%" => {
            if rhs == 0 {
                return None;
            }
            lhs.wrapping_rem(rhs)
        }
        "@" => {
            // Truncate lhs to a multiple of rhs, which must be a power of
            // two so this is a simple mask.
            if rhs == 0 || !rhs.is_power_of_two() {
                return None;
            }
            lhs & !(rhs - 1)
        }
        _ => return None,
    };
    Some(V::from_u64(result))
}

/// Parse a signed decimal or `0x`-prefixed hex integer literal.
fn parse_literal<V: RegisterValue>(tok: &str) -> Option<V> {
    let value = if let Some(hex) = tok.strip_prefix("0x") {
        i64::from_str_radix(hex, 16).ok()?
    } else {
        i64::from_str(tok).ok()?
    };
    Some(V::from_u64(value as u64))
}

/// Registers a STACK WIN evaluation reports to the caller, when set.
const WIN_OUTPUT_REGS: &[&str] = &["$eip", "$esp", "$ebp", "$ebx", "$esi", "$edi"];

impl WindowsFrameInfo {
    /// Compute the caller's registers from the callee's.
    ///
    /// `grand_callee_parameter_size` is the parameter size of the function
    /// called by this frame's function, which Windows frame layouts fold
    /// into the frame size.
    ///
    /// The result holds `.ra` plus whichever of the well-known x86
    /// registers the record recovered; `.ra` and `$esp` are mandatory.
    pub fn find_caller_regs<V: RegisterValue>(
        &self,
        callee_regs: &RegisterValueMap<V>,
        memory: &dyn MemoryRegion,
        grand_callee_parameter_size: u32,
    ) -> Option<RegisterValueMap<V>> {
        match self.program_string_or_base_pointer {
            WinStackThing::ProgramString(ref expr) => {
                trace!("unwinding with program string: {}", expr);
                self.eval_program_string(expr, callee_regs, memory, grand_callee_parameter_size)
            }
            WinStackThing::AllocatesBasePointer(allocates_base_pointer) => {
                trace!("unwinding with frame pointer omission data");
                self.unwind_fpo(
                    callee_regs,
                    memory,
                    grand_callee_parameter_size,
                    allocates_base_pointer,
                )
            }
        }
    }

    fn frame_size(&self, grand_callee_parameter_size: u32) -> u32 {
        self.local_size + self.saved_register_size + grand_callee_parameter_size
    }

    fn eval_program_string<V: RegisterValue>(
        &self,
        expr: &str,
        callee_regs: &RegisterValueMap<V>,
        memory: &dyn MemoryRegion,
        grand_callee_parameter_size: u32,
    ) -> Option<RegisterValueMap<V>> {
        let mut vars: HashMap<&str, V> = HashMap::new();

        let callee_esp = *callee_regs.get("$esp")?;
        let callee_ebp = *callee_regs.get("$ebp")?;
        vars.insert("$esp", callee_esp);
        vars.insert("$ebp", callee_ebp);
        // Some program strings read $ebx, so seed it when we have it.
        if let Some(&callee_ebx) = callee_regs.get("$ebx") {
            vars.insert("$ebx", callee_ebx);
        }

        let search_start = V::from_u64(
            callee_esp
                .to_u64()
                .wrapping_add(self.frame_size(grand_callee_parameter_size) as u64),
        );
        vars.insert(".cbParams", V::from_u64(self.parameter_size as u64));
        vars.insert(
            ".cbCalleeParams",
            V::from_u64(grand_callee_parameter_size as u64),
        );
        vars.insert(".cbSavedRegs", V::from_u64(self.saved_register_size as u64));
        vars.insert(".cbLocals", V::from_u64(self.local_size as u64));
        vars.insert(".raSearch", search_start);
        vars.insert(".raSearchStart", search_start);

        eval_win_expr(expr, &mut vars, memory)?;

        let mut caller_regs = RegisterValueMap::new();
        for &reg in WIN_OUTPUT_REGS {
            if let Some(&val) = vars.get(reg) {
                caller_regs.insert(reg.to_string(), val);
            }
        }
        // A usable result must recover at least the return address and
        // the stack pointer.
        let ra = *caller_regs.get("$eip")?;
        caller_regs.get("$esp")?;
        caller_regs.insert(RA_RULE_NAME.to_string(), ra);
        Some(caller_regs)
    }

    /// The older frame-pointer-omission layout: no program, just a known
    /// frame size to pop and maybe a saved base pointer to restore.
    fn unwind_fpo<V: RegisterValue>(
        &self,
        callee_regs: &RegisterValueMap<V>,
        memory: &dyn MemoryRegion,
        grand_callee_parameter_size: u32,
        allocates_base_pointer: bool,
    ) -> Option<RegisterValueMap<V>> {
        let frame_size = self.frame_size(grand_callee_parameter_size) as u64;
        let callee_esp = callee_regs.get("$esp")?.to_u64();

        let eip_address = callee_esp.wrapping_add(frame_size);
        let caller_eip = memory.get_memory_at_address(eip_address, V::BYTES)?;
        let caller_esp = eip_address.wrapping_add(V::BYTES as u64);

        let mut caller_regs = RegisterValueMap::new();
        let caller_ebp = if allocates_base_pointer {
            let ebp_address = callee_esp
                .wrapping_add(grand_callee_parameter_size as u64)
                .wrapping_add(self.saved_register_size as u64)
                .wrapping_sub(2 * V::BYTES as u64);
            memory.get_memory_at_address(ebp_address, V::BYTES)?
        } else {
            // The frame didn't touch ebp, so the callee's value is still
            // the caller's. ebx commonly survives these frames too.
            if let Some(&callee_ebx) = callee_regs.get("$ebx") {
                caller_regs.insert("$ebx".to_string(), callee_ebx);
            }
            callee_regs.get("$ebp")?.to_u64()
        };

        caller_regs.insert(RA_RULE_NAME.to_string(), V::from_u64(caller_eip));
        caller_regs.insert("$eip".to_string(), V::from_u64(caller_eip));
        caller_regs.insert("$esp".to_string(), V::from_u64(caller_esp));
        caller_regs.insert("$ebp".to_string(), V::from_u64(caller_ebp));
        Some(caller_regs)
    }
}

/// A value on the program string evaluation stack: either a plain integer
/// or the name of a variable, resolved to its current value on use.
enum WinVal<'a, V> {
    Var(&'a str),
    Int(V),
    Undef,
}

impl<'a, V: RegisterValue> WinVal<'a, V> {
    fn into_var(self) -> Option<&'a str> {
        if let WinVal::Var(var) = self {
            Some(var)
        } else {
            None
        }
    }
    fn into_int(self, vars: &HashMap<&'a str, V>) -> Option<V> {
        match self {
            WinVal::Var(var) => vars.get(&var).copied(),
            WinVal::Int(int) => Some(int),
            WinVal::Undef => None,
        }
    }
}

/// Run a program string against `vars`, leaving its assignments in place.
fn eval_win_expr<'a, V: RegisterValue>(
    expr: &'a str,
    vars: &mut HashMap<&'a str, V>,
    memory: &dyn MemoryRegion,
) -> Option<()> {
    let mut stack: Vec<WinVal<'a, V>> = Vec::new();
    for tok in expr.split_ascii_whitespace() {
        match tok {
            "+" | "-" | "*" | "/" | "%" | "@" => {
                let rhs = stack.pop()?.into_int(vars)?;
                let lhs = stack.pop()?.into_int(vars)?;
                stack.push(WinVal::Int(binop(tok, lhs, rhs)?));
            }
            "^" => {
                let ptr = stack.pop()?.into_int(vars)?;
                let word = memory.get_memory_at_address(ptr.to_u64(), V::BYTES)?;
                stack.push(WinVal::Int(V::from_u64(word)));
            }
            "=" => {
                let rhs = stack.pop()?;
                let lhs = stack.pop()?.into_var()?;
                if let WinVal::Undef = rhs {
                    // Assigning .undef unbinds the variable.
                    vars.remove(&lhs);
                } else {
                    let value = rhs.into_int(vars)?;
                    vars.insert(lhs, value);
                }
            }
            ".undef" => {
                stack.push(WinVal::Undef);
            }
            _ => {
                if tok.starts_with('$') || tok.starts_with('.') {
                    stack.push(WinVal::Var(tok));
                } else if let Some(val) = parse_literal(tok) {
                    stack.push(WinVal::Int(val));
                } else {
                    trace!("program string eval failed on token: {}", tok);
                    return None;
                }
            }
        }
    }
    // Leftover values on the stack are tolerated; the results live in the
    // variable dictionary.
    Some(())
}

#[cfg(test)]
mod test {
    use super::super::types::{WindowsFrameType, WinStackThing};
    use super::*;

    /// Memory holding a little-endian byte image starting at address 0.
    struct TestMemory(Vec<u8>);

    impl MemoryRegion for TestMemory {
        fn get_memory_at_address(&self, address: u64, size: usize) -> Option<u64> {
            let start = address as usize;
            let bytes = self.0.get(start..start.checked_add(size)?)?;
            let mut value: u64 = 0;
            for (i, &b) in bytes.iter().enumerate() {
                value |= (b as u64) << (i * 8);
            }
            Some(value)
        }
    }

    fn regs<V: RegisterValue>(pairs: &[(&str, V)]) -> RegisterValueMap<V> {
        pairs
            .iter()
            .map(|&(name, val)| (name.to_string(), val))
            .collect()
    }

    fn cfi(cfa: &str, ra: &str, others: &[(&str, &str)]) -> CfiFrameInfo {
        CfiFrameInfo {
            cfa_rule: cfa.to_string(),
            ra_rule: ra.to_string(),
            register_rules: others
                .iter()
                .map(|&(reg, expr)| (reg.to_string(), expr.to_string()))
                .collect(),
        }
    }

    fn win_info(program_string_or_base_pointer: WinStackThing) -> WindowsFrameInfo {
        WindowsFrameInfo {
            frame_type: WindowsFrameType::FrameData,
            address: 0x1000,
            size: 0x100,
            prologue_size: 4,
            epilogue_size: 8,
            parameter_size: 16,
            saved_register_size: 12,
            local_size: 24,
            max_stack_size: 64,
            program_string_or_base_pointer,
        }
    }

    fn win_program(expr: &str) -> WindowsFrameInfo {
        win_info(WinStackThing::ProgramString(expr.to_string()))
    }

    #[test]
    fn test_cfi_doc_example() {
        // cfa = callee_rsp + 24, ra = *(cfa - 8), rax = *(cfa - 16)
        let info = cfi(
            "$rsp 24 +",
            ".cfa -8 + ^",
            &[("$rax", ".cfa -16 + ^")],
        );
        let callee = regs(&[("$rsp", 32u64), ("$rip", 1600)]);

        const FINAL_CFA: usize = 32 + 24;
        const FINAL_RA: u64 = 0xFA1E_F2E6_A2DF_2B68;
        const FINAL_RAX: u64 = 0xB3EF_04CE_4321_FE2A;
        let mut stack = vec![0; 1600];
        stack[FINAL_CFA - 8..FINAL_CFA].copy_from_slice(&FINAL_RA.to_le_bytes());
        stack[FINAL_CFA - 16..FINAL_CFA - 8].copy_from_slice(&FINAL_RAX.to_le_bytes());
        let memory = TestMemory(stack);

        let caller = info.find_caller_regs(&callee, &memory).unwrap();
        assert_eq!(caller.len(), 3);
        assert_eq!(caller[".cfa"], FINAL_CFA as u64);
        assert_eq!(caller[".ra"], FINAL_RA);
        assert_eq!(caller["$rax"], FINAL_RAX);
    }

    #[test]
    fn test_cfi_ops() {
        // 32-bit to stress truncation.
        let callee = regs(&[("$esp", 32u32), ("$eip", 1600)]);
        let memory = TestMemory(vec![0; 1600]);

        let run = |cfa_rule: &str, ra_rule: &str| {
            cfi(cfa_rule, ra_rule, &[]).find_caller_regs(&callee, &memory)
        };

        // Each operator.
        let caller = run("1 2 +", "-4 0 +").unwrap();
        assert_eq!(caller[".cfa"], 3);
        assert_eq!(caller[".ra"], -4i32 as u32);

        let caller = run("5 3 -", "-4 2 -").unwrap();
        assert_eq!(caller[".cfa"], 2);
        assert_eq!(caller[".ra"], -6i32 as u32);

        let caller = run("5 3 *", "7 2 *").unwrap();
        assert_eq!(caller[".cfa"], 15);
        assert_eq!(caller[".ra"], 14);

        let caller = run("5 3 /", "8 2 /").unwrap();
        assert_eq!(caller[".cfa"], 1);
        assert_eq!(caller[".ra"], 4);

        let caller = run("5 3 %", "-1 2 %").unwrap();
        assert_eq!(caller[".cfa"], 2);
        assert_eq!(caller[".ra"], 1);

        let caller = run("8 16 @", "161 8 @").unwrap();
        assert_eq!(caller[".cfa"], 0);
        assert_eq!(caller[".ra"], 160);

        // Hex literals work too.
        let caller = run("0x10 2 +", "8").unwrap();
        assert_eq!(caller[".cfa"], 0x12);

        // Missing operands.
        assert!(run("1 +", "8").is_none());
        assert!(run("1 -", "8").is_none());
        assert!(run("^", "8").is_none());

        // Invalid operands.
        assert!(run("1 0 /", "8").is_none());
        assert!(run("1 0 %", "8").is_none());
        assert!(run("1 0 @", "8").is_none());
        assert!(run("1 3 @", "8").is_none());

        // Junk left on the stack.
        assert!(run("8 12", "8").is_none());
        // Empty expression.
        assert!(run("", "8").is_none());
    }

    #[test]
    fn test_cfi_errors() {
        let callee = regs(&[("$rsp", 32u64), ("$rip", 1600)]);
        let memory = TestMemory(vec![0; 1600]);

        // Missing .ra or .cfa rules.
        assert!(cfi("$rsp 8 +", "", &[])
            .find_caller_regs(&callee, &memory)
            .is_none());
        assert!(cfi("", "$rsp 8 +", &[])
            .find_caller_regs(&callee, &memory)
            .is_none());

        // .cfa is undef.
        assert!(cfi(".undef", "8", &[])
            .find_caller_regs(&callee, &memory)
            .is_none());
        // .ra is undef.
        assert!(cfi("8", ".undef", &[])
            .find_caller_regs(&callee, &memory)
            .is_none());

        // .cfa may not use itself.
        assert!(cfi(".cfa", "8", &[])
            .find_caller_regs(&callee, &memory)
            .is_none());

        // Reading an unknown callee register.
        assert!(cfi("8", "$kitties", &[])
            .find_caller_regs(&callee, &memory)
            .is_none());

        // Reading out of bounds.
        assert!(cfi("2000 ^", "8", &[])
            .find_caller_regs(&callee, &memory)
            .is_none());

        // The assignment operator belongs to program strings only.
        assert!(cfi("12", "$rsp $rip =", &[])
            .find_caller_regs(&callee, &memory)
            .is_none());

        // A failing register rule discards the entire result.
        assert!(cfi("8", "12", &[("$rax", "1 0 /")])
            .find_caller_regs(&callee, &memory)
            .is_none());
        assert!(cfi("8", "12", &[("$rax", ".undef")])
            .find_caller_regs(&callee, &memory)
            .is_none());
    }

    #[test]
    fn test_cfi_corners() {
        let callee = regs(&[("$rsp", 32u64), ("$rip", 1600)]);
        let memory = TestMemory(vec![0; 1600]);

        // Plain values, no operators.
        let caller = cfi("8", "12", &[("$rax", "16")])
            .find_caller_regs(&callee, &memory)
            .unwrap();
        assert_eq!(caller.len(), 3);
        assert_eq!(caller[".cfa"], 8);
        assert_eq!(caller[".ra"], 12);
        assert_eq!(caller["$rax"], 16);

        // Rules may use the computed .cfa.
        let caller = cfi("7", ".cfa 1 +", &[("$rax", ".cfa 2 -")])
            .find_caller_regs(&callee, &memory)
            .unwrap();
        assert_eq!(caller[".cfa"], 7);
        assert_eq!(caller[".ra"], 8);
        assert_eq!(caller["$rax"], 5);
    }

    #[test]
    fn test_cfi_arm_register_names() {
        // ARM rules name registers without a $ sigil.
        let callee = regs(&[("pc", 32u64), ("x11", 1600)]);
        let memory = TestMemory(vec![0; 1600]);

        let caller = cfi("8", "12", &[("x11", "16"), ("x12", "x11 .cfa +")])
            .find_caller_regs(&callee, &memory)
            .unwrap();
        assert_eq!(caller.len(), 4);
        assert_eq!(caller[".cfa"], 8);
        assert_eq!(caller[".ra"], 12);
        assert_eq!(caller["x11"], 16);
        assert_eq!(caller["x12"], 1608);
    }

    #[test]
    fn test_win_program_string_doc_example() {
        let info = win_program("$T0 $ebp = $eip $T0 4 + ^ = $ebp $T0 ^ = $esp $T0 8 + =");
        let callee = regs(&[("$ebp", 16u32), ("$esp", 1600)]);

        const FINAL_EBP: u32 = 0xFA1E_F2E6;
        const FINAL_EIP: u32 = 0xB3EF_04CE;
        let mut stack = vec![0; 1600];
        stack[16..20].copy_from_slice(&FINAL_EBP.to_le_bytes());
        stack[20..24].copy_from_slice(&FINAL_EIP.to_le_bytes());
        let memory = TestMemory(stack);

        let caller = info.find_caller_regs(&callee, &memory, 4).unwrap();
        assert_eq!(caller[".ra"], FINAL_EIP);
        assert_eq!(caller["$eip"], FINAL_EIP);
        assert_eq!(caller["$ebp"], FINAL_EBP);
        assert_eq!(caller["$esp"], 24);
    }

    #[test]
    fn test_win_program_string_corners() {
        let callee = regs(&[("$esp", 32u32), ("$ebp", 1600)]);
        let memory = TestMemory(vec![0; 1600]);
        let run = |expr: &str| win_program(expr).find_caller_regs(&callee, &memory, 4);

        // Trailing garbage on the stack is tolerated.
        let caller = run("$eip 1 = $esp 2 = $ebp 3 = 4 5 6").unwrap();
        assert_eq!(caller[".ra"], 1);
        assert_eq!(caller["$esp"], 2);
        assert_eq!(caller["$ebp"], 3);

        // Temporaries aren't reported.
        let caller = run("$T0 1 = $eip $T0 5 + = $esp 2 =").unwrap();
        assert_eq!(caller[".ra"], 6);
        assert!(caller.get("$T0").is_none());

        // The frame constants are available.
        let caller = run("$eip .cbParams .cbSavedRegs + .cbLocals + = $esp .raSearch =").unwrap();
        assert_eq!(caller[".ra"], 16 + 12 + 24);
        // .raSearch = esp + locals + saved regs + grand callee params.
        assert_eq!(caller["$esp"], 32 + 24 + 12 + 4);

        // Callee registers seeded into the dictionary forward through.
        let caller = run("$eip 1 =").unwrap();
        assert_eq!(caller[".ra"], 1);
        assert_eq!(caller["$esp"], 32);
        assert_eq!(caller["$ebp"], 1600);

        // Assigning .undef deletes a variable, and a result without $esp
        // or a recovered $eip is unusable.
        assert!(run("$eip 1 = $esp 2 = $esp .undef =").is_none());
        assert!(run("$esp 2 =").is_none());
    }

    #[test]
    fn test_win_program_string_errors() {
        let callee = regs(&[("$esp", 32u32), ("$ebp", 1600)]);
        let memory = TestMemory(vec![0; 1600]);
        let run = |expr: &str| win_program(expr).find_caller_regs(&callee, &memory, 4);

        // Reading an undefined variable.
        assert!(run("$eip $kitties = $esp 2 =").is_none());
        // Assigning to a non-variable.
        assert!(run("0 2 =").is_none());
        // Variables must start with $ or a dot.
        assert!(run("eip 2 =").is_none());
        // Deref out of bounds.
        assert!(run("$eip 2000 ^ = $esp 2 =").is_none());
        // Stack underflow.
        assert!(run("= $esp 2 =").is_none());

        // A callee without $esp/$ebp can't be unwound at all.
        let no_regs: RegisterValueMap<u32> = RegisterValueMap::new();
        assert!(win_program("$eip 1 = $esp 2 =")
            .find_caller_regs(&no_regs, &memory, 4)
            .is_none());
    }

    #[test]
    fn test_win_fpo() {
        // local_size 24 + saved_register_size 12 + grand callee params 4
        // puts the return address 40 bytes up the stack.
        let info = win_info(WinStackThing::AllocatesBasePointer(false));
        let callee = regs(&[("$esp", 32u32), ("$ebp", 1600), ("$ebx", 7)]);

        const CALLER_EIP: u32 = 0xB3EF_04CE;
        let mut stack = vec![0; 256];
        stack[72..76].copy_from_slice(&CALLER_EIP.to_le_bytes());
        let memory = TestMemory(stack);

        let caller = info.find_caller_regs(&callee, &memory, 4).unwrap();
        assert_eq!(caller[".ra"], CALLER_EIP);
        assert_eq!(caller["$eip"], CALLER_EIP);
        assert_eq!(caller["$esp"], 76);
        // ebp wasn't touched by this frame, ebx is forwarded.
        assert_eq!(caller["$ebp"], 1600);
        assert_eq!(caller["$ebx"], 7);
    }

    #[test]
    fn test_win_fpo_allocates_base_pointer() {
        let info = win_info(WinStackThing::AllocatesBasePointer(true));
        let callee = regs(&[("$esp", 32u32), ("$ebp", 1600)]);

        const CALLER_EIP: u32 = 0xB3EF_04CE;
        const CALLER_EBP: u32 = 0xFA1E_F2E6;
        let mut stack = vec![0; 256];
        stack[72..76].copy_from_slice(&CALLER_EIP.to_le_bytes());
        // ebp was saved at esp + grand callee params 4 + saved regs 12 - 8.
        stack[40..44].copy_from_slice(&CALLER_EBP.to_le_bytes());
        let memory = TestMemory(stack);

        let caller = info.find_caller_regs(&callee, &memory, 4).unwrap();
        assert_eq!(caller[".ra"], CALLER_EIP);
        assert_eq!(caller["$esp"], 76);
        assert_eq!(caller["$ebp"], CALLER_EBP);
    }
}
