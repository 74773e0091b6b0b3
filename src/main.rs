/*
    Demo driver: a non-inclusive directory-based cache level with several
    private children above it and flat memory below. Runs either the
    built-in workload or per-child trace files, then dumps statistics.

    usage: cachesim-dir [MESI|MSI] [trace_basename]

    Trace files are read from ./traces/ as <basename><n>.data with one
    `<op> <hex-addr>` pair per line (0 = read, 1 = write, 2 = flush,
    3 = flush-invalidate), matching the test file format of the simpler
    bus-based simulators this grew out of.
*/

use std::collections::VecDeque;
use std::{env, fs};

use env_logger::Env;
use log::info;

use cachesim_dir::error::SimError;
use cachesim_dir::mesi::{Addr, Config, Protocol};
use cachesim_dir::sim::{ChildOp, System};

fn read_tracefiles(basename: &str, line_size: usize) -> Result<Vec<Vec<ChildOp>>, SimError> {
    let mut scripts = Vec::new();
    let mut paths: Vec<_> = fs::read_dir("traces")?
        .filter_map(|p| p.ok())
        .map(|p| p.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with(basename) && n.ends_with(".data"))
        })
        .collect();
    paths.sort();
    for path in paths {
        info!("reading trace file {:?}", path);
        let content = fs::read_to_string(&path)?;
        let mut ops = VecDeque::new();
        for (lineno, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let mut parts = line.split_whitespace();
            let op = parts
                .next()
                .and_then(|s| s.parse::<u32>().ok())
                .ok_or(SimError::Trace { line: lineno + 1, msg: "missing op code".into() })?;
            let addr = parts
                .next()
                .and_then(|s| u64::from_str_radix(s.trim_start_matches("0x"), 16).ok())
                .ok_or(SimError::Trace { line: lineno + 1, msg: "missing or bad address".into() })?;
            let addr = Addr(addr).line_base(line_size);
            ops.push_back(match op {
                0 => ChildOp::Read(addr),
                1 => ChildOp::Write(addr, (addr.0 >> 8) as u8),
                2 => ChildOp::Flush(addr),
                3 => ChildOp::FlushInv(addr),
                other => {
                    return Err(SimError::Trace {
                        line: lineno + 1,
                        msg: format!("unknown op code {}", other),
                    })
                }
            });
        }
        scripts.push(ops.into());
    }
    if scripts.is_empty() {
        return Err(SimError::Trace { line: 0, msg: format!("no trace files match '{}'", basename) });
    }
    Ok(scripts)
}

/// Built-in workload: four children hammering a small set of lines with
/// enough overlap to exercise sharing, upgrades, fetches and flushes.
fn builtin_workload(line_size: usize) -> Vec<Vec<ChildOp>> {
    let a = |n: u64| Addr(n * line_size as u64);
    vec![
        vec![
            ChildOp::Read(a(0)),
            ChildOp::Read(a(1)),
            ChildOp::Write(a(0), 0x11),
            ChildOp::Read(a(2)),
            ChildOp::Flush(a(0)),
            ChildOp::Read(a(3)),
        ],
        vec![
            ChildOp::Read(a(0)),
            ChildOp::Write(a(1), 0x22),
            ChildOp::Read(a(0)),
            ChildOp::FlushInv(a(1)),
            ChildOp::Read(a(4)),
        ],
        vec![
            ChildOp::Write(a(2), 0x33),
            ChildOp::Read(a(1)),
            ChildOp::Read(a(0)),
            ChildOp::Write(a(4), 0x44),
        ],
        vec![
            ChildOp::Read(a(2)),
            ChildOp::Read(a(3)),
            ChildOp::Write(a(3), 0x55),
            ChildOp::Read(a(1)),
        ],
    ]
}

fn run() -> Result<(), SimError> {
    let args: Vec<String> = env::args().collect();

    let protocol = match args.get(1).map(String::as_str) {
        Some("MESI") | None => Protocol::MESI,
        Some("MSI") => Protocol::MSI,
        Some(other) => return Err(SimError::Protocol(other.to_string())),
    };
    let cfg = Config { protocol, ..Config::default() };
    cfg.validate()?;

    let scripts = match args.get(2) {
        Some(basename) => read_tracefiles(basename, cfg.line_size)?,
        None => builtin_workload(cfg.line_size),
    };

    info!("starting simulation: {:?}, {} children", protocol, scripts.len());
    let mut system = System::new(cfg, scripts, 8);
    system.check_invariants = true;
    let quiet = system.run(1_000_000);

    println!("finished in {} cycles (quiet: {})", system.time(), quiet);
    for child in &system.children {
        println!("{}: {} ops completed", child.id, child.ops_done);
    }
    println!("{}", system.ctrl.stats().report());
    Ok(())
}

fn main() {
    let env = Env::default()
        .filter_or("CACHESIM_LOG", "info")
        .write_style_or("CACHESIM_LOG_STYLE", "auto");
    env_logger::init_from_env(env);

    if let Err(e) = run() {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}
