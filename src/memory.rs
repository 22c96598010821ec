// The typed segmented memory model.
//
// An address is a plain integer that encodes scope, type, and index at
// once. Each scope owns five consecutive pages of PAGE cells, one page
// per type, in the fixed order ints, floats, strings, bools, ptrs:
//
//   [0, 5000)      global scope
//   [5000, 10000)  constants
//   [10000, 15000) function-local (per activation)
//
// Recovering (scope, type, index) from an address is pure integer
// arithmetic; every component that consumes addresses relies on it.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

pub const PAGE: usize = 1000;
pub const SPACES: usize = 5;

pub const GLOBAL_BASE: usize = 0;
pub const CONSTANT_BASE: usize = PAGE * SPACES;
pub const LOCAL_BASE: usize = CONSTANT_BASE * 2;

// The types a memory cell can have. `Ptr` is internal to the toolchain:
// it implements array indirection and is not a surface type. `Object`
// never owns a cell; an object variable is a bundle of attribute cells.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Type {
    Int,
    Float,
    Str,
    Bool,
    Ptr,
    Object(String),
}

impl Type {
    // The four user-visible types.
    pub fn is_simple(&self) -> bool {
        matches!(self, Type::Int | Type::Float | Type::Str | Type::Bool)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Type::Int => write!(f, "int"),
            Type::Float => write!(f, "float"),
            Type::Str => write!(f, "string"),
            Type::Bool => write!(f, "bool"),
            Type::Ptr => write!(f, "ptr"),
            Type::Object(name) => write!(f, "{}", name),
        }
    }
}

// All values a cell can hold. A `Ptr` holds the absolute address of
// another cell; the VM applies exactly one level of indirection.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Ptr(usize),
}

#[derive(Clone, Debug, PartialEq, Error)]
pub enum MemoryError {
    #[error("maximum space for type '{0}' was exceeded")]
    CapacityExceeded(Type),
    #[error("the address '{0}' is not mapped in this memory")]
    InvalidAddress(usize),
    #[error("cannot store '{value}' in a cell of type '{ty}'")]
    InvalidCoercion { value: Value, ty: Type },
    #[error("operands of type '{0}' and '{1}' do not support this operation")]
    OperandMismatch(Type, Type),
    #[error("the pointer cell at address '{0}' holds no target")]
    DanglingPointer(usize),
}

pub type MemoryResult<T> = std::result::Result<T, MemoryError>;

// Factors out the boiler plate of the binary operator methods.
//
// `arith` expands to the numeric promotion table shared by the four
// arithmetic operators; `compare` to the ordering table shared by the
// relational operators. Any pair of operand types not in the table is
// an OperandMismatch.
macro_rules! operator {
    (arith $name:ident, $op:tt) => {
        pub fn $name(&self, other: &Value) -> MemoryResult<Value> {
            use Value::*;
            match (self, other) {
                (Int(a), Int(b)) => Ok(Int(a $op b)),
                (Int(a), Float(b)) => Ok(Float(*a as f64 $op b)),
                (Float(a), Int(b)) => Ok(Float(a $op *b as f64)),
                (Float(a), Float(b)) => Ok(Float(a $op b)),
                (a, b) => Err(MemoryError::OperandMismatch(a.type_of(), b.type_of())),
            }
        }
    };

    (compare $name:ident, $op:tt) => {
        pub fn $name(&self, other: &Value) -> MemoryResult<Value> {
            use Value::*;
            match (self, other) {
                (Int(a), Int(b)) => Ok(Bool(a $op b)),
                (Float(a), Float(b)) => Ok(Bool(a $op b)),
                (a, b) => Err(MemoryError::OperandMismatch(a.type_of(), b.type_of())),
            }
        }
    };

    (logic $name:ident, $op:tt) => {
        pub fn $name(&self, other: &Value) -> MemoryResult<Value> {
            use Value::*;
            match (self, other) {
                (Bool(a), Bool(b)) => Ok(Bool(*a $op *b)),
                (a, b) => Err(MemoryError::OperandMismatch(a.type_of(), b.type_of())),
            }
        }
    };
}

impl Value {
    pub fn type_of(&self) -> Type {
        match self {
            Value::Int(_) => Type::Int,
            Value::Float(_) => Type::Float,
            Value::Str(_) => Type::Str,
            Value::Bool(_) => Type::Bool,
            Value::Ptr(_) => Type::Ptr,
        }
    }

    // The cell addresses a value can stand for: an int result of address
    // arithmetic, or a pointer cell's target.
    pub fn as_address(&self) -> Option<usize> {
        match self {
            Value::Int(i) if *i >= 0 => Some(*i as usize),
            Value::Ptr(p) => Some(*p),
            _ => None,
        }
    }

    // `+` additionally concatenates strings.
    pub fn add(&self, other: &Value) -> MemoryResult<Value> {
        use Value::*;
        match (self, other) {
            (Str(a), Str(b)) => Ok(Str(format!("{}{}", a, b))),
            (Int(a), Int(b)) => Ok(Int(a + b)),
            (Int(a), Float(b)) => Ok(Float(*a as f64 + b)),
            (Float(a), Int(b)) => Ok(Float(a + *b as f64)),
            (Float(a), Float(b)) => Ok(Float(a + b)),
            (a, b) => Err(MemoryError::OperandMismatch(a.type_of(), b.type_of())),
        }
    }

    operator! { arith sub, - }
    operator! { arith mul, * }

    // Division truncates toward zero for ints. The zero-divisor check
    // lives in the VM, where it maps to ARITHMETIC_EXCEPTION.
    operator! { arith div, / }

    operator! { compare lt, < }
    operator! { compare le, <= }
    operator! { compare gt, > }
    operator! { compare ge, >= }

    operator! { logic and, && }
    operator! { logic or, || }

    // Equality is defined only between values of the same type.
    pub fn eq(&self, other: &Value) -> MemoryResult<Value> {
        use Value::*;
        match (self, other) {
            (Int(a), Int(b)) => Ok(Bool(a == b)),
            (Float(a), Float(b)) => Ok(Bool(a == b)),
            (Str(a), Str(b)) => Ok(Bool(a == b)),
            (Bool(a), Bool(b)) => Ok(Bool(a == b)),
            (a, b) => Err(MemoryError::OperandMismatch(a.type_of(), b.type_of())),
        }
    }

    pub fn ne(&self, other: &Value) -> MemoryResult<Value> {
        match self.eq(other)? {
            Value::Bool(v) => Ok(Value::Bool(!v)),
            _ => unreachable!(),
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Value::Int(0) => true,
            Value::Float(f) => *f == 0.0,
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{}", i),
            // Integral floats keep a decimal digit so the textual form
            // still reads (and re-parses) as a float.
            Value::Float(x) if x.is_finite() && x.fract() == 0.0 => write!(f, "{:.1}", x),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{}", s),
            Value::Bool(true) => write!(f, "true"),
            Value::Bool(false) => write!(f, "false"),
            Value::Ptr(p) => write!(f, "{}", p),
        }
    }
}

// Type of any address, regardless of which scope owns it.
pub fn type_from_address(address: usize) -> Type {
    match (address % (PAGE * SPACES)) / PAGE {
        0 => Type::Int,
        1 => Type::Float,
        2 => Type::Str,
        3 => Type::Bool,
        _ => Type::Ptr,
    }
}

// One page of cells for a single type.
#[derive(Clone, Debug, PartialEq)]
pub struct TypeSpace {
    initial_address: usize,
    cells: Vec<Option<Value>>,
}

impl TypeSpace {
    fn new(initial_address: usize) -> TypeSpace {
        TypeSpace {
            initial_address,
            cells: Vec::new(),
        }
    }

    fn sized(initial_address: usize, size: usize) -> TypeSpace {
        TypeSpace {
            initial_address,
            cells: vec![None; size],
        }
    }

    fn push(&mut self, ty: &Type, cell: Option<Value>) -> MemoryResult<usize> {
        if self.cells.len() >= PAGE {
            return Err(MemoryError::CapacityExceeded(ty.clone()));
        }
        self.cells.push(cell);
        Ok(self.initial_address + self.cells.len() - 1)
    }
}

// A resource quintuple: how many cells of each type one scope uses.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Resources {
    pub ints: usize,
    pub floats: usize,
    pub strings: usize,
    pub bools: usize,
    pub ptrs: usize,
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "({},{},{},{},{})",
            self.ints, self.floats, self.strings, self.bools, self.ptrs
        )
    }
}

impl FromStr for Resources {
    type Err = String;

    fn from_str(s: &str) -> Result<Resources, String> {
        let inner = s
            .strip_prefix('(')
            .and_then(|s| s.strip_suffix(')'))
            .ok_or_else(|| format!("malformed resource quintuple '{}'", s))?;
        let counts: Result<Vec<usize>, _> = inner.split(',').map(|p| p.trim().parse()).collect();
        match counts.map_err(|e| format!("malformed resource quintuple '{}': {}", s, e))? {
            ref c if c.len() == 5 => Ok(Resources {
                ints: c[0],
                floats: c[1],
                strings: c[2],
                bools: c[3],
                ptrs: c[4],
            }),
            _ => Err(format!("malformed resource quintuple '{}'", s)),
        }
    }
}

// One scope's memory: five ordered type spaces.
#[derive(Clone, Debug, PartialEq)]
pub struct MemoryManager {
    base: usize,
    ints: TypeSpace,
    floats: TypeSpace,
    strings: TypeSpace,
    bools: TypeSpace,
    ptrs: TypeSpace,
}

impl MemoryManager {
    pub fn new(base: usize) -> MemoryManager {
        MemoryManager {
            base,
            ints: TypeSpace::new(base),
            floats: TypeSpace::new(base + PAGE),
            strings: TypeSpace::new(base + PAGE * 2),
            bools: TypeSpace::new(base + PAGE * 3),
            ptrs: TypeSpace::new(base + PAGE * 4),
        }
    }

    // An activation image: every sub-space pre-sized to the footprint
    // recorded for the function, all cells uninitialized.
    pub fn with_resources(base: usize, resources: Resources) -> MemoryManager {
        MemoryManager {
            base,
            ints: TypeSpace::sized(base, resources.ints),
            floats: TypeSpace::sized(base + PAGE, resources.floats),
            strings: TypeSpace::sized(base + PAGE * 2, resources.strings),
            bools: TypeSpace::sized(base + PAGE * 3, resources.bools),
            ptrs: TypeSpace::sized(base + PAGE * 4, resources.ptrs),
        }
    }

    fn space(&self, ty: &Type) -> MemoryResult<&TypeSpace> {
        match ty {
            Type::Int => Ok(&self.ints),
            Type::Float => Ok(&self.floats),
            Type::Str => Ok(&self.strings),
            Type::Bool => Ok(&self.bools),
            Type::Ptr => Ok(&self.ptrs),
            Type::Object(_) => Err(MemoryError::OperandMismatch(ty.clone(), ty.clone())),
        }
    }

    fn space_mut(&mut self, ty: &Type) -> MemoryResult<&mut TypeSpace> {
        match ty {
            Type::Int => Ok(&mut self.ints),
            Type::Float => Ok(&mut self.floats),
            Type::Str => Ok(&mut self.strings),
            Type::Bool => Ok(&mut self.bools),
            Type::Ptr => Ok(&mut self.ptrs),
            Type::Object(_) => Err(MemoryError::OperandMismatch(ty.clone(), ty.clone())),
        }
    }

    pub fn type_of(&self, address: usize) -> Type {
        type_from_address(address)
    }

    // Reserve `size` uninitialized cells; the address of the first is
    // returned. Declared-but-unassigned variables live here until a
    // `set` arrives.
    pub fn reserve(&mut self, ty: &Type, size: usize) -> MemoryResult<usize> {
        let space = self.space_mut(ty)?;
        if space.cells.len() + size > PAGE {
            return Err(MemoryError::CapacityExceeded(ty.clone()));
        }
        let first = space.initial_address + space.cells.len();
        for _ in 0..size {
            space.cells.push(None);
        }
        Ok(first)
    }

    // Constant pooling: the address of an existing equal value, else a
    // fresh cell. Calling twice with equal values is idempotent.
    pub fn find_or_insert(&mut self, value: Value) -> MemoryResult<usize> {
        let ty = value.type_of();
        let space = self.space_mut(&ty)?;
        for (i, cell) in space.cells.iter().enumerate() {
            if cell.as_ref() == Some(&value) {
                return Ok(space.initial_address + i);
            }
        }
        space.push(&ty, Some(value))
    }

    // Append one cell (possibly the sentinel) to the sub-space implied
    // by the type. Used to rebuild a memory image from an object file.
    pub fn append(&mut self, ty: &Type, value: Option<Value>) -> MemoryResult<usize> {
        let space = self.space_mut(ty)?;
        space.push(ty, value)
    }

    pub fn get(&self, address: usize) -> Option<&Value> {
        let ty = self.type_of(address);
        let space = self.space(&ty).ok()?;
        let index = address.checked_sub(space.initial_address)?;
        space.cells.get(index)?.as_ref()
    }

    // The canonical write. The stored value is coerced to the declared
    // type of the slot; a write to a ptr slot stores through the target
    // (exactly one level).
    pub fn set(&mut self, address: usize, value: Value) -> MemoryResult<()> {
        let ty = self.type_of(address);
        if ty == Type::Ptr {
            let target = match self.get(address) {
                Some(v) => v
                    .as_address()
                    .ok_or_else(|| MemoryError::DanglingPointer(address))?,
                None => return Err(MemoryError::DanglingPointer(address)),
            };
            return self.set(target, value);
        }
        let coerced = coerce(&ty, value)?;
        let space = self.space_mut(&ty)?;
        let index = address
            .checked_sub(space.initial_address)
            .filter(|i| *i < space.cells.len())
            .ok_or(MemoryError::InvalidAddress(address))?;
        space.cells[index] = Some(coerced);
        Ok(())
    }

    // Store a target address into a ptr slot directly, no dereference.
    pub fn add_ptr(&mut self, address: usize, target: usize) -> MemoryResult<()> {
        let space = &mut self.ptrs;
        let index = address
            .checked_sub(space.initial_address)
            .filter(|i| *i < space.cells.len())
            .ok_or(MemoryError::InvalidAddress(address))?;
        space.cells[index] = Some(Value::Ptr(target));
        Ok(())
    }

    pub fn resources(&self) -> Resources {
        Resources {
            ints: self.ints.cells.len(),
            floats: self.floats.cells.len(),
            strings: self.strings.cells.len(),
            bools: self.bools.cells.len(),
            ptrs: self.ptrs.cells.len(),
        }
    }

    // Truncate every sub-space. Used when a function activation ends.
    pub fn clear(&mut self) {
        self.ints.cells.clear();
        self.floats.cells.clear();
        self.strings.cells.clear();
        self.bools.cells.clear();
        self.ptrs.cells.clear();
    }

    // Every cell with its absolute address, sub-spaces in type order.
    pub fn cells(&self) -> impl Iterator<Item = (usize, Option<&Value>)> {
        let spaces = [&self.ints, &self.floats, &self.strings, &self.bools, &self.ptrs];
        let mut out = Vec::new();
        for space in &spaces {
            for (i, cell) in space.cells.iter().enumerate() {
                out.push((space.initial_address + i, cell.as_ref()));
            }
        }
        out.into_iter()
    }
}

// Coerce a value to the declared type of a slot.
fn coerce(ty: &Type, value: Value) -> MemoryResult<Value> {
    let fail = |value: Value| MemoryError::InvalidCoercion {
        value,
        ty: ty.clone(),
    };
    match ty {
        Type::Int => match value {
            Value::Int(i) => Ok(Value::Int(i)),
            Value::Float(f) => Ok(Value::Int(f as i64)),
            Value::Bool(b) => Ok(Value::Int(b as i64)),
            Value::Str(s) => match s.trim().parse::<i64>() {
                Ok(i) => Ok(Value::Int(i)),
                Err(_) => Err(fail(Value::Str(s))),
            },
            v => Err(fail(v)),
        },
        Type::Float => match value {
            Value::Float(f) => Ok(Value::Float(f)),
            Value::Int(i) => Ok(Value::Float(i as f64)),
            Value::Bool(b) => Ok(Value::Float(b as i64 as f64)),
            Value::Str(s) => match s.trim().parse::<f64>() {
                Ok(f) => Ok(Value::Float(f)),
                Err(_) => Err(fail(Value::Str(s))),
            },
            v => Err(fail(v)),
        },
        Type::Str => Ok(Value::Str(value.to_string())),
        Type::Bool => match value {
            Value::Bool(b) => Ok(Value::Bool(b)),
            Value::Str(s) => Ok(Value::Bool(s == "true")),
            _ => Ok(Value::Bool(false)),
        },
        Type::Ptr => match value {
            Value::Ptr(p) => Ok(Value::Ptr(p)),
            v => Err(fail(v)),
        },
        Type::Object(_) => Err(fail(value)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::Value::*;

    #[test]
    fn test_address_partition() {
        // type_from_address(reserve(t)) == t, in every scope.
        for base in &[GLOBAL_BASE, CONSTANT_BASE, LOCAL_BASE] {
            let mut memory = MemoryManager::new(*base);
            for ty in &[Type::Int, Type::Float, Type::Str, Type::Bool, Type::Ptr] {
                let address = memory.reserve(ty, 1).unwrap();
                assert_eq!(type_from_address(address), *ty);
            }
        }
    }

    #[test]
    fn test_reserve_is_uninitialized() {
        let mut memory = MemoryManager::new(GLOBAL_BASE);
        let address = memory.reserve(&Type::Int, 1).unwrap();
        assert_eq!(memory.get(address), None);
        memory.set(address, Int(7)).unwrap();
        assert_eq!(memory.get(address), Some(&Int(7)));
    }

    #[test]
    fn test_find_or_insert_is_idempotent() {
        let mut memory = MemoryManager::new(CONSTANT_BASE);
        let a = memory.find_or_insert(Int(42)).unwrap();
        let b = memory.find_or_insert(Int(42)).unwrap();
        assert_eq!(a, b);
        assert_eq!(memory.resources().ints, 1);

        let c = memory.find_or_insert(Str("hi".to_string())).unwrap();
        assert_eq!(type_from_address(c), Type::Str);
    }

    #[test]
    fn test_capacity_exceeded() {
        let mut memory = MemoryManager::new(GLOBAL_BASE);
        memory.reserve(&Type::Int, PAGE).unwrap();
        assert_eq!(
            memory.reserve(&Type::Int, 1),
            Err(MemoryError::CapacityExceeded(Type::Int))
        );
        // The other sub-spaces are unaffected.
        assert!(memory.reserve(&Type::Float, 1).is_ok());
    }

    #[test]
    fn test_set_coercions() {
        let mut memory = MemoryManager::new(GLOBAL_BASE);
        let i = memory.reserve(&Type::Int, 1).unwrap();
        let b = memory.reserve(&Type::Bool, 1).unwrap();
        let s = memory.reserve(&Type::Str, 1).unwrap();

        memory.set(i, Float(3.9)).unwrap();
        assert_eq!(memory.get(i), Some(&Int(3)));
        memory.set(i, Str(" 5".to_string())).unwrap();
        assert_eq!(memory.get(i), Some(&Int(5)));
        assert!(memory.set(i, Str("abc".to_string())).is_err());

        memory.set(b, Str("true".to_string())).unwrap();
        assert_eq!(memory.get(b), Some(&Bool(true)));
        memory.set(b, Str("no".to_string())).unwrap();
        assert_eq!(memory.get(b), Some(&Bool(false)));

        memory.set(s, Int(12)).unwrap();
        assert_eq!(memory.get(s), Some(&Str("12".to_string())));
    }

    #[test]
    fn test_ptr_write_through() {
        let mut memory = MemoryManager::new(LOCAL_BASE);
        let target = memory.reserve(&Type::Int, 1).unwrap();
        let slot = memory.reserve(&Type::Ptr, 1).unwrap();
        memory.add_ptr(slot, target).unwrap();
        memory.set(slot, Int(9)).unwrap();
        assert_eq!(memory.get(target), Some(&Int(9)));
        // Reading the ptr slot itself yields the raw target address.
        assert_eq!(memory.get(slot), Some(&Ptr(target)));
    }

    #[test]
    fn test_clear_matches_construction() {
        let mut memory = MemoryManager::new(LOCAL_BASE);
        memory.reserve(&Type::Int, 3).unwrap();
        memory.reserve(&Type::Bool, 1).unwrap();
        memory.clear();
        assert_eq!(memory, MemoryManager::new(LOCAL_BASE));
        assert_eq!(memory.resources(), Resources::default());
    }

    #[test]
    fn test_with_resources() {
        let resources = Resources {
            ints: 2,
            floats: 0,
            strings: 1,
            bools: 0,
            ptrs: 1,
        };
        let memory = MemoryManager::with_resources(LOCAL_BASE, resources);
        assert_eq!(memory.resources(), resources);
        assert_eq!(memory.get(LOCAL_BASE), None);
    }

    #[test]
    fn test_resources_round_trip() {
        let resources = Resources {
            ints: 1,
            floats: 2,
            strings: 3,
            bools: 4,
            ptrs: 5,
        };
        assert_eq!(resources.to_string(), "(1,2,3,4,5)");
        assert_eq!("(1,2,3,4,5)".parse::<Resources>(), Ok(resources));
        assert!("(1,2,3)".parse::<Resources>().is_err());
    }

    #[test]
    fn test_value_operations() {
        assert_eq!(Int(3).add(&Int(4)), Ok(Int(7)));
        assert_eq!(Int(3).add(&Float(0.5)), Ok(Float(3.5)));
        assert_eq!(
            Str("ab".to_string()).add(&Str("cd".to_string())),
            Ok(Str("abcd".to_string()))
        );
        assert_eq!(Int(7).div(&Int(2)), Ok(Int(3)));
        assert_eq!(Int(2).lt(&Int(3)), Ok(Bool(true)));
        assert_eq!(Bool(true).and(&Bool(false)), Ok(Bool(false)));
        assert_eq!(Int(2).eq(&Int(2)), Ok(Bool(true)));
        assert_eq!(Int(2).ne(&Int(3)), Ok(Bool(true)));
        assert!(Int(1).lt(&Float(2.0)).is_err());
        assert!(Bool(true).add(&Bool(false)).is_err());
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Int(11).to_string(), "11");
        assert_eq!(Float(3.0).to_string(), "3.0");
        assert_eq!(Float(3.25).to_string(), "3.25");
        assert_eq!(Bool(true).to_string(), "true");
        assert_eq!(Str("hi".to_string()).to_string(), "hi");
    }
}
