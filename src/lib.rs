// Adeo: a compiler and virtual machine for the Adeo language.
//
// This program is free software: you can redistribute it and/or
// modify it under the terms of the GNU Lesser General Public License
// as published by the Free Software Foundation, either version 3 of
// the License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the GNU
// Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public
// License along with this program.  If not, see
// <https://www.gnu.org/licenses/>.

#[macro_use]
extern crate lazy_static;

// Print only when running under the test harness.
#[macro_export]
macro_rules! trace(
    ( $($thing:expr),* ) => { if cfg!(test) { println! { $($thing),* } } };
);

pub mod arrays;
pub mod ast;
pub mod classes;
pub mod codec;
pub mod compiler;
pub mod context;
pub mod error;
pub mod functions;
pub mod memory;
pub mod parser;
pub mod quadruples;
pub mod semantics;
pub mod variables;
pub mod vm;

use lalrpop_util::lalrpop_mod;
lalrpop_mod!(pub grammar);
