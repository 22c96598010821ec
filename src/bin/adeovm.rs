// Adeo virtual machine driver.
//
// One positional argument: a path ending in .adeoobj. Exit 0 on a
// successful run. Runtime failures print an ADEO EXECUTION ERROR
// diagnostic to stderr and exit 1, as does an object file that
// records a failed compilation.

use std::env::args;
use std::fs;
use std::io::{stdin, stdout};
use std::process::exit;

use adeo::codec;
use adeo::vm::VirtualMachine;

fn main() {
    let path = match (args().nth(1), args().nth(2)) {
        (Some(path), None) if path.ends_with(".adeoobj") => path,
        _ => {
            eprintln!("usage: adeovm <file.adeoobj>");
            exit(1);
        }
    };

    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("{}: {}", path, e);
            exit(1);
        }
    };

    let program = match codec::parse_object(&text) {
        Ok(program) => program,
        Err(error) => {
            eprintln!("ADEO EXECUTION ERROR");
            eprintln!("{} {}", path, error);
            exit(1);
        }
    };

    let stdin = stdin();
    let stdout = stdout();
    let mut vm = VirtualMachine::new(program);
    if let Err(error) = vm.run(&mut stdin.lock(), &mut stdout.lock()) {
        eprintln!("ADEO EXECUTION ERROR");
        eprintln!("{} {}", path, error);
        exit(1);
    }
}
