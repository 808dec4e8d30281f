use dkl_segregation::{
    run_with_config, CategoryTaxonomy, CountRecord, EngineConfig, GeographyIndex, GeographyLink,
};

fn usage() -> ! {
    eprintln!(
        "Usage:\n  cargo run --example metro_report -- [--threads N]\n\n\
Runs a small ACS-coded income table through the taxonomy and prints per-unit\n\
divergences and per-region mutual information (bits)."
    );
    std::process::exit(2);
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut threads = 1usize;
    let mut it = args.iter();
    while let Some(a) = it.next() {
        match a.as_str() {
            "--threads" => {
                threads = it
                    .next()
                    .and_then(|n| n.parse().ok())
                    .unwrap_or_else(|| usage());
            }
            _ => usage(),
        }
    }

    // Raw B19001 rows for four block groups: _001 is the reported total, the rest are brackets.
    let raw_rows: [(&str, [f64; 4]); 4] = [
        ("060750101001", [400.0, 180.0, 120.0, 100.0]),
        ("060750101002", [350.0, 40.0, 110.0, 200.0]),
        ("060750102001", [500.0, 60.0, 140.0, 300.0]),
        ("060014001001", [300.0, 150.0, 100.0, 50.0]),
    ];
    let codes = ["B19001_001", "B19001_002", "B19001_011", "B19001_017"];
    let mut raw = Vec::new();
    for (unit, counts) in raw_rows {
        for (code, count) in codes.iter().zip(counts) {
            raw.push(CountRecord::new(unit, "income", *code, count));
        }
    }
    // A stray unit with no crosswalk entry.
    raw.push(CountRecord::new("999999999999", "income", "B19001_002", 12.0));

    let taxonomy = CategoryTaxonomy::acs5();
    let table = taxonomy.apply(&raw).unwrap();

    let geo = GeographyIndex::from_links([
        GeographyLink::new("060750101001", "06075", "41860")
            .with_title("San Francisco-Oakland-Fremont, CA")
            .with_region_type("Metropolitan Statistical Area"),
        GeographyLink::new("060750101002", "06075", "41860"),
        GeographyLink::new("060750102001", "06075", "41860"),
        GeographyLink::new("060014001001", "06001", "41860"),
    ])
    .unwrap();

    let config = EngineConfig::default()
        .with_threads(threads)
        .with_taxonomy(taxonomy);
    let out = run_with_config(&table, &geo, &config).unwrap();

    println!("unit divergence (bits):");
    for e in &out.divergence {
        println!(
            "  {:<14} {:<14} {:>10.6}",
            e.unit_id, e.region_id, e.dkl_unit
        );
    }
    println!();

    println!("region mutual information (bits):");
    for m in &out.mutual_information {
        println!(
            "  {:<8} {:<36} units={:<3} pop={:>8.1} MI={:.6} MI_by_category={:.6}",
            m.region_id,
            m.region_title,
            m.units,
            m.population,
            m.mutual_information,
            m.mutual_information_by_category
        );
    }
    println!();

    println!("diagnostics: {:?}", out.diagnostics.counts);
    for d in out.diagnostics.iter() {
        println!("  {d}");
    }
}
