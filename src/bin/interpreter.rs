//! Bytecode interpreter CLI.
//!
//! Loads an encoded program, runs it to HALT or a fault, and prints the
//! final register and flag state.
//!
//! # Usage
//! ```text
//! interpreter <input.bin> [OPTIONS]
//! ```
//!
//! # Options
//! - `--steps <n>`: Step limit before the run is declared stuck
//! - `--trace`: Log every executed instruction in disassembly form

use ilvm::machine::Machine;
use ilvm::utils::log::{set_level, Level};
use ilvm::{error, info};
use std::env;
use std::fs;
use std::process;

const USAGE: &str = "\
IL Interpreter

USAGE:
    {program} <input.bin> [OPTIONS]

ARGS:
    <input.bin>     Encoded program to execute

OPTIONS:
    --steps <n>     Step limit before the run is declared stuck
    --trace         Log every executed instruction
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

    let input_path = &args[1];
    let mut step_limit: Option<u64> = None;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--steps" => {
                i += 1;
                if i >= args.len() {
                    error!("--steps requires an argument");
                    process::exit(1);
                }
                step_limit = Some(args[i].parse::<u64>().unwrap_or_else(|_| {
                    error!("invalid step limit: {}", args[i]);
                    process::exit(1);
                }));
                i += 1;
            }
            "--trace" => {
                set_level(Level::Debug);
                i += 1;
            }
            other => {
                error!("unexpected argument: {other}\n");
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }

    let code = match fs::read(input_path) {
        Ok(code) => code,
        Err(e) => {
            error!("failed to read {input_path}: {e}");
            process::exit(1);
        }
    };

    let mut machine = Machine::new(code);
    if let Some(limit) = step_limit {
        machine.set_step_limit(limit);
    }

    match machine.run() {
        Ok(()) => {
            println!("{machine}");
        }
        Err(e) => {
            error!("execution fault: {e}");
            // The state is left exactly as of the faulting step.
            println!("{machine}");
            process::exit(1);
        }
    }
}
