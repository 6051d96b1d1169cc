use clap;
use env_logger;

use memrev::analysis::{self, CancelToken};
use memrev::context::{Config, ProcessContext};
use memrev::mem::{DumpDir, MemorySource};
use std::path::{Path, PathBuf};
use std::process;
use std::rc::Rc;

fn main() {
    env_logger::init();

    let app = clap::App::new("memrev")
        .about("Recover C-style record layouts from a raw process memory dump")
        .arg(
            clap::Arg::with_name("dump")
                .short("d")
                .long("dump")
                .required(true)
                .takes_value(true)
                .help("Dump directory to read (layout.json + memory.bin)"),
        )
        .arg(
            clap::Arg::with_name("cache-dir")
                .long("cache-dir")
                .takes_value(true)
                .help("Where to keep the <dump>.d cache directory. Defaults to the dump's parent directory."),
        )
        .subcommand(
            clap::SubCommand::with_name("reverse")
                .about("Reverse the data structures from the process memory"),
        )
        .subcommand(
            clap::SubCommand::with_name("reverse-show")
                .about("Show the record at a specific address")
                .arg(address_arg()),
        )
        .subcommand(
            clap::SubCommand::with_name("reverse-hex")
                .about("Show the hex values for the record at that address")
                .arg(address_arg()),
        )
        .subcommand(
            clap::SubCommand::with_name("reverse-parents")
                .about("List the records pointing to the record at this address")
                .arg(address_arg()),
        );

    let matches = match app.get_matches_safe() {
        Ok(matches) => matches,
        Err(e) => match e.kind {
            clap::ErrorKind::HelpDisplayed | clap::ErrorKind::VersionDisplayed => {
                println!("{}", e.message);
                return;
            }
            _ => {
                eprintln!("{}", e.message);
                process::exit(2);
            }
        },
    };

    if let Err(e) = run(&matches) {
        eprintln!("memrev: {}", e);
        let code = e
            .downcast_ref::<memrev::Error>()
            .map(|err| err.exit_code())
            .unwrap_or(3);
        process::exit(code);
    }
}

fn address_arg() -> clap::Arg<'static, 'static> {
    clap::Arg::with_name("address")
        .required(true)
        .takes_value(true)
        .help("Record memory address, in hex")
}

fn run(matches: &clap::ArgMatches) -> Result<(), anyhow::Error> {
    let dump_path = Path::new(matches.value_of("dump").expect("dump is required"));
    let dump = DumpDir::open(dump_path)?;
    let heaps = dump.heaps().to_vec();

    let cache_root = matches
        .value_of("cache-dir")
        .map(PathBuf::from)
        .unwrap_or_else(|| dump_path.parent().unwrap_or_else(|| Path::new(".")).to_owned());
    let config = Config {
        cache_root,
        ..Config::default()
    };

    let ctx = ProcessContext::load(Rc::new(dump) as Rc<dyn MemorySource>, &heaps, config)?;
    let cancel = CancelToken::new();

    match matches.subcommand() {
        ("reverse", _) => {
            let summary = analysis::reverse_instances(&ctx, &cancel)?;
            println!(
                "{} of {} records processed; results in {}",
                summary.processed,
                summary.records,
                ctx.cache_dir().display()
            );
        }
        ("reverse-show", Some(sub)) => {
            let address = parse_address(sub);
            analysis::ensure_classified(&ctx, &cancel)?;
            match ctx.record_at(address) {
                Some(record) => println!("{}", record.borrow().describe()),
                None => println!("None"),
            }
        }
        ("reverse-hex", Some(sub)) => {
            let address = parse_address(sub);
            match ctx.record_at(address) {
                Some(record) => {
                    let rec = record.borrow();
                    print!("{}", hex_dump(&rec.bytes()?, address));
                }
                None => println!("None"),
            }
        }
        ("reverse-parents", Some(sub)) => {
            let address = parse_address(sub);
            analysis::ensure_classified(&ctx, &cancel)?;
            let parents = ctx.predecessors(address)?;
            if parents.is_empty() {
                println!("None");
            } else {
                for parent in parents {
                    let record = ctx.record(parent)?;
                    println!("#{:#x}\n{}", parent, record.borrow().describe());
                }
            }
        }
        _ => {
            eprintln!("missing subcommand; try --help");
            process::exit(2);
        }
    }
    Ok(())
}

fn parse_address(matches: &clap::ArgMatches) -> u64 {
    let text = matches.value_of("address").expect("address is required");
    let trimmed = text.trim_start_matches("0x");
    match u64::from_str_radix(trimmed, 16) {
        Ok(address) => address,
        Err(_) => {
            eprintln!("bad address {:?}: expected hex", text);
            process::exit(2);
        }
    }
}

fn hex_dump(bytes: &[u8], base: u64) -> String {
    let mut out = String::new();
    for (i, row) in bytes.chunks(16).enumerate() {
        let hex: Vec<String> = row.iter().map(|b| format!("{:02x}", b)).collect();
        let ascii: String = row
            .iter()
            .map(|&b| {
                if b.is_ascii_graphic() || b == b' ' {
                    b as char
                } else {
                    '.'
                }
            })
            .collect();
        out.push_str(&format!(
            "{:#010x}  {:<47}  |{}|\n",
            base + (i * 16) as u64,
            hex.join(" "),
            ascii
        ));
    }
    out
}
