// Quadruples: the three-address code shared by the compiler and the VM.
//
// A quadruple is (operator, left, right, result); each address field is
// optional. Instruction indices are positions in the growable list; the
// next-to-emit index doubles as the program counter at run time. Jump
// targets are not raw indices but addresses of int cells in the constant
// pool, so every field reads uniformly as "address of a cell".

use std::fmt;
use std::str::FromStr;

use strum::{Display, EnumString};

use crate::ast::BinOp;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Display, EnumString)]
pub enum Op {
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "-")]
    Sub,
    #[strum(serialize = "*")]
    Mul,
    #[strum(serialize = "/")]
    Div,
    #[strum(serialize = "<")]
    Lt,
    #[strum(serialize = "<=")]
    Le,
    #[strum(serialize = ">")]
    Gt,
    #[strum(serialize = ">=")]
    Ge,
    #[strum(serialize = "==")]
    Eq,
    #[strum(serialize = "!=")]
    Ne,
    #[strum(serialize = "&&")]
    And,
    #[strum(serialize = "||")]
    Or,
    #[strum(serialize = "=")]
    Assign,
    #[strum(serialize = "PRINT")]
    Print,
    #[strum(serialize = "READ")]
    Read,
    #[strum(serialize = "GOTO")]
    Goto,
    #[strum(serialize = "GOTOF")]
    GotoF,
    #[strum(serialize = "VER")]
    Ver,
    #[strum(serialize = "PTR")]
    Ptr,
    #[strum(serialize = "ERA")]
    Era,
    #[strum(serialize = "PARAM")]
    Param,
    #[strum(serialize = "GOSUB")]
    Gosub,
    #[strum(serialize = "ENDFUNC")]
    EndFunc,
    #[strum(serialize = "ENDPROG")]
    EndProg,
}

impl From<BinOp> for Op {
    fn from(op: BinOp) -> Op {
        match op {
            BinOp::Add => Op::Add,
            BinOp::Sub => Op::Sub,
            BinOp::Mul => Op::Mul,
            BinOp::Div => Op::Div,
            BinOp::Lt => Op::Lt,
            BinOp::Lte => Op::Le,
            BinOp::Gt => Op::Gt,
            BinOp::Gte => Op::Ge,
            BinOp::Eq => Op::Eq,
            BinOp::Neq => Op::Ne,
            BinOp::And => Op::And,
            BinOp::Or => Op::Or,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Quad {
    pub op: Op,
    pub left: Option<usize>,
    pub right: Option<usize>,
    pub result: Option<usize>,
}

impl Quad {
    pub fn new(op: Op, left: Option<usize>, right: Option<usize>, result: Option<usize>) -> Quad {
        Quad {
            op,
            left,
            right,
            result,
        }
    }
}

fn field(address: &Option<usize>) -> String {
    match address {
        Some(a) => a.to_string(),
        None => "None".to_string(),
    }
}

impl fmt::Display for Quad {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "({},{},{},{})",
            self.op,
            field(&self.left),
            field(&self.right),
            field(&self.result)
        )
    }
}

impl FromStr for Quad {
    type Err = String;

    fn from_str(s: &str) -> Result<Quad, String> {
        let inner = s
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .ok_or_else(|| format!("malformed quadruple '{}'", s))?;
        let parts: Vec<&str> = inner.split(',').collect();
        if parts.len() != 4 {
            return Err(format!("malformed quadruple '{}'", s));
        }
        let op = parts[0]
            .parse::<Op>()
            .map_err(|_| format!("unknown operator '{}'", parts[0]))?;
        let address = |p: &str| -> Result<Option<usize>, String> {
            if p == "None" {
                Ok(None)
            } else {
                p.parse::<usize>()
                    .map(Some)
                    .map_err(|_| format!("malformed address '{}'", p))
            }
        };
        Ok(Quad {
            op,
            left: address(parts[1])?,
            right: address(parts[2])?,
            result: address(parts[3])?,
        })
    }
}

// The growable instruction list.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Quadruples {
    quads: Vec<Quad>,
}

impl Quadruples {
    pub fn new() -> Quadruples {
        Quadruples { quads: Vec::new() }
    }

    // Append a quadruple; the emitted index is returned for patching.
    pub fn emit(
        &mut self,
        op: Op,
        left: Option<usize>,
        right: Option<usize>,
        result: Option<usize>,
    ) -> usize {
        self.quads.push(Quad::new(op, left, right, result));
        self.quads.len() - 1
    }

    // The next index to be emitted; the program counter starts here at 0.
    pub fn instr_ptr(&self) -> usize {
        self.quads.len()
    }

    pub fn len(&self) -> usize {
        self.quads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.quads.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Quad> {
        self.quads.get(index)
    }

    pub fn set(&mut self, index: usize, quad: Quad) {
        self.quads[index] = quad;
    }

    // Back-patch a jump: keep the operator and operands, point the
    // result field at the given constant-pool address.
    pub fn patch(&mut self, index: usize, target_address: usize) {
        let quad = &mut self.quads[index];
        quad.result = Some(target_address);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Quad> {
        self.quads.iter()
    }
}
