use dkl_segregation::{
    run_with_config, CountRecord, CountTable, EngineConfig, GeographyIndex, GeographyLink,
    GroupPair, JointCountRecord, JointCountTable,
};

fn main() {
    // race × income cross-tab for three tracts of one metro.
    let cells = [
        ("t1", "white", "low", 20.0),
        ("t1", "white", "high", 140.0),
        ("t1", "black", "low", 30.0),
        ("t1", "black", "high", 10.0),
        ("t2", "white", "low", 60.0),
        ("t2", "white", "high", 40.0),
        ("t2", "black", "low", 90.0),
        ("t2", "black", "high", 30.0),
        ("t3", "white", "low", 50.0),
        ("t3", "white", "high", 50.0),
        ("t3", "black", "low", 50.0),
        ("t3", "black", "high", 50.0),
    ];
    let joint = JointCountTable::new(
        GroupPair::new("race", "income"),
        cells
            .iter()
            .map(|(u, a, b, c)| JointCountRecord::new(*u, *a, *b, *c))
            .collect(),
    );

    // One-way race table summed from the same cells.
    let mut race = Vec::new();
    for unit in ["t1", "t2", "t3"] {
        for group in ["white", "black"] {
            let n: f64 = cells
                .iter()
                .filter(|(u, a, _, _)| *u == unit && *a == group)
                .map(|(_, _, _, c)| c)
                .sum();
            race.push(CountRecord::new(unit, "race", group, n));
        }
    }
    let table = CountTable::new(race).with_joint(joint);

    let geo = GeographyIndex::from_links([
        GeographyLink::new("t1", "c1", "metro"),
        GeographyLink::new("t2", "c1", "metro"),
        GeographyLink::new("t3", "c2", "metro"),
    ])
    .unwrap();

    let config = EngineConfig::default().with_verification(1e-9);
    let out = run_with_config(&table, &geo, &config).unwrap();
    assert_eq!(out.diagnostics.counts.factored_mismatch, 0);

    println!("unit   D(race×income)   D(race)   D(income)   residual");
    for e in &out.joint {
        println!(
            "{:<6} {:>14.6} {:>9.6} {:>11.6} {:>10.6}",
            e.unit_id, e.dkl_joint, e.dkl_marginal_a, e.dkl_marginal_b, e.residual
        );
    }
    println!();
    for r in &out.joint_regions {
        println!(
            "{} [{}]: joint MI={:.6} race MI={:.6} income MI={:.6} residual={:+.6}",
            r.region_id, r.group_pair, r.dkl_joint, r.dkl_marginal_a, r.dkl_marginal_b, r.residual
        );
    }
    if let Some(m) = out.region_mi("race", "metro") {
        println!("one-way race MI (check): {:.6}", m.mutual_information);
    }
}
