// Adeo compiler driver.
//
// One positional argument: a path ending in .adeo. The program image
// (or, on a compile error, the error report) is written to a sibling
// .adeoobj file. Compile errors still exit 0: the error is the object
// file's content. Bad arguments and unreadable input exit 1.

use std::env::args;
use std::fs;
use std::process::exit;

use adeo::codec;
use adeo::compiler::Compiler;

fn main() {
    let path = match (args().nth(1), args().nth(2)) {
        (Some(path), None) if path.ends_with(".adeo") => path,
        _ => {
            eprintln!("usage: adeoc <file.adeo>");
            exit(1);
        }
    };

    let source = match fs::read_to_string(&path) {
        Ok(source) => source,
        Err(e) => {
            eprintln!("{}: {}", path, e);
            exit(1);
        }
    };

    let object = match Compiler::compile(&source) {
        Ok(compiler) => codec::write_object(&compiler),
        Err(error) => codec::write_error(&source, &error),
    };

    let object_path = format!("{}.adeoobj", path.trim_end_matches(".adeo"));
    if let Err(e) = fs::write(&object_path, object) {
        eprintln!("{}: {}", object_path, e);
        exit(1);
    }
}
