use std::env;
use std::path::Path;
use std::process;

use vdex2dex::convert;

fn main() {
    let args: Vec<String> = env::args().collect();

    let mut json = false;
    let mut paths = vec![];
    for arg in &args[1..] {
        match arg.as_str() {
            "--json" => json = true,
            _ => paths.push(arg.as_str()),
        }
    }

    if paths.len() != 2 {
        eprintln!("Usage: vdex2dex [--json] <vdex file> <output dex file>");
        process::exit(2);
    }

    match convert(Path::new(paths[0]), Path::new(paths[1])) {
        Ok(result) => {
            if json {
                // ConvertResult is a plain summary struct; serialization
                // cannot fail on it.
                println!("{}", serde_json::to_string_pretty(&result).unwrap());
            } else {
                if result.archives_found > 1 {
                    println!(
                        "Warning: container holds {} dex files, only the first was converted.",
                        result.archives_found
                    );
                }
                println!(
                    "Wrote dex file to {} ({} instruction(s) in {} method(s) restored).",
                    paths[1], result.instructions_rewritten, result.methods_rewritten
                );
            }
        }
        Err(e) => {
            eprintln!("Aborted due to error: {e}");
            process::exit(1);
        }
    }
}
