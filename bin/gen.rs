use clap::{Arg, Command};
use std::io::{self, Write};

const COUNTRIES: &[&str] = &["US", "DE", "FR", "GB", "JP"];

fn main() -> anyhow::Result<()> {
    let matches = Command::new("gen")
        .about("Write a synthetic JSON array of contact rows to stdout")
        .arg(
            Arg::new("rows")
                .long("rows")
                .value_parser(clap::value_parser!(u64))
                .required(true),
        )
        .arg(
            Arg::new("extra_cols")
                .long("extra-cols")
                .help("Unmapped filler columns per row")
                .value_parser(clap::value_parser!(usize))
                .default_value("0"),
        )
        .get_matches();

    let rows: u64 = *matches.get_one("rows").unwrap();
    let extra: usize = *matches.get_one("extra_cols").unwrap();

    let mut out = io::BufWriter::new(io::stdout().lock());

    // Deterministic data; casing and padding vary so hashing normalization matters
    writeln!(&mut out, "[")?;
    for i in 0..rows {
        let country = COUNTRIES[(i as usize) % COUNTRIES.len()];
        write!(
            &mut out,
            r#"  {{"Email":" User{i}@Example.com","Phone":"+1555{i:07}","First Name":"First{i}","Last Name":"LAST{i}","Country":"{country}","Zip":"{zip:05}""#,
            zip = i % 100_000,
        )?;
        for c in 0..extra {
            write!(&mut out, r#","col{c}":"v{c}_{i}""#)?;
        }
        write!(&mut out, "}}")?;
        if i + 1 < rows {
            write!(&mut out, ",")?;
        }
        writeln!(&mut out)?;
        if i % 10_000 == 0 {
            out.flush()?;
        } // keep buffers moving on huge runs
    }
    writeln!(&mut out, "]")?;

    out.flush()?;
    Ok(())
}
