//! Assembly to bytecode compiler CLI.
//!
//! Reads an IL assembly source file and writes the encoded program.
//!
//! # Usage
//! ```text
//! assembler <input.il> <output.bin>
//! ```

use ilvm::assembler::assemble_file;
use ilvm::{error, info};
use std::env;
use std::fs;
use std::process;

const USAGE: &str = "\
IL Assembler

USAGE:
    {program} <input.il> <output.bin>

ARGS:
    <input.il>      Assembly source file to compile
    <output.bin>    Destination for the encoded program

OPTIONS:
    -h, --help      Print this help message
";

fn print_usage(program: &str) {
    info!("{}", USAGE.replace("{program}", program));
}

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    if args.len() != 3 {
        error!("expected exactly two arguments\n");
        print_usage(&args[0]);
        process::exit(1);
    }

    let input_path = &args[1];
    let output_path = &args[2];

    let code = match assemble_file(input_path) {
        Ok(code) => code,
        Err(e) => {
            error!("assembly failed: {e}");
            process::exit(1);
        }
    };

    if let Err(e) = fs::write(output_path, &code) {
        error!("failed to write {output_path}: {e}");
        process::exit(1);
    }

    info!("Assembled {input_path} -> {output_path} ({} bytes)", code.len());
}
