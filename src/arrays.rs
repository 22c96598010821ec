// Array dimension bookkeeping.
//
// Each dimension carries (upper, R, m): R is the running size-prefix
// product, m the stride consumed by the indexing code. Dimensions are
// registered first, then `finalize` fixes the total size and strides;
// index emission assumes a finalized descriptor.

use crate::error::{ErrorKind, ProgramError, ProgramResult};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dimension {
    pub upper: i64,
    pub r: i64,
    pub m: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ArrayManager {
    pub dimensions: Vec<Dimension>,
    pub size: i64,
}

impl ArrayManager {
    pub fn new() -> ArrayManager {
        ArrayManager {
            dimensions: Vec::new(),
            size: 0,
        }
    }

    pub fn add_dimension(&mut self, upper: i64) -> ProgramResult<()> {
        if upper <= 0 {
            return Err(ProgramError::runtime(
                ErrorKind::UnsupportedOperation,
                format!("An array dimension must be a positive integer, got '{}'", upper),
            ));
        }
        let r = match self.dimensions.last() {
            Some(previous) => previous.r * upper,
            None => upper,
        };
        self.dimensions.push(Dimension { upper, r, m: 0 });
        Ok(())
    }

    // Fix the total size and compute every stride. The first stride is
    // size / upper[0]; each later stride divides the previous by its
    // own upper bound.
    pub fn finalize(&mut self) {
        if let Some(last) = self.dimensions.last() {
            self.size = last.r;
            let mut previous = self.size;
            for dim in &mut self.dimensions {
                dim.m = previous / dim.upper;
                previous = dim.m;
            }
        }
    }
}
