// src/main.rs
//! CNN layer simulator CLI
//! Configuration checks, single passes and seed sweeps against the golden reference

use clap::{Arg, ArgAction, ArgMatches, Command};
use log::{info, warn};
use std::error::Error;
use std::path::Path;

use cnn_layer_sim::config::LayerConfig;
use cnn_layer_sim::fixed::WeightWord;
use cnn_layer_sim::layer::PoolType;
use cnn_layer_sim::stimulus::{Stimulus, Testbench};
use cnn_layer_sim::validation::{check_pass, run_seed_sweep, GoldenReference, ReferenceData, StimulusRange};

fn main() -> Result<(), Box<dyn Error>> {
    let matches = cli().get_matches();
    init_logging(matches.get_count("verbose"));

    match matches.subcommand() {
        Some(("validate", sub_matches)) => cmd_validate(sub_matches)?,
        Some(("config-gen", sub_matches)) => cmd_config_gen(sub_matches)?,
        Some(("run", sub_matches)) => cmd_run(sub_matches)?,
        Some(("sweep", sub_matches)) => cmd_sweep(sub_matches)?,
        Some(("golden", sub_matches)) => cmd_golden(sub_matches)?,
        _ => {
            println!("CNN Layer Simulator v0.1");
            println!("Use --help for available commands");
        }
    }

    Ok(())
}

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();
}

fn config_arg() -> Arg {
    Arg::new("config")
        .short('c')
        .long("config")
        .value_name("FILE")
        .help("Configuration file")
        .default_value("config/layer.toml")
}

fn pool_type_arg() -> Arg {
    Arg::new("pool-type")
        .short('p')
        .long("pool-type")
        .value_name("MODE")
        .help("Pooling mode: max, avg, min, pass (or its 2-bit code)")
        .default_value("max")
}

fn cli() -> Command {
    Command::new("cnn-layer-sim")
        .version("0.1.0")
        .about("Cycle-accurate fixed-point CNN layer simulator")
        .arg(Arg::new("verbose")
            .short('v')
            .long("verbose")
            .help("Increase log verbosity (repeatable)")
            .action(ArgAction::Count)
            .global(true))
        .subcommand(
            Command::new("validate")
                .about("Validate a layer configuration file")
                .arg(Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file to validate")
                    .required(true))
        )
        .subcommand(
            Command::new("config-gen")
                .about("Generate the reference configuration file")
                .arg(Arg::new("output")
                    .short('o')
                    .long("output")
                    .value_name("FILE")
                    .help("Output file path")
                    .default_value("config/layer-default.toml"))
        )
        .subcommand(
            Command::new("run")
                .about("Stream one seeded activation map through the layer")
                .arg(config_arg())
                .arg(pool_type_arg())
                .arg(Arg::new("seed")
                    .short('s')
                    .long("seed")
                    .help("Stimulus seed")
                    .default_value("1"))
                .arg(Arg::new("weights")
                    .short('w')
                    .long("weights")
                    .value_name("HEX")
                    .help("Packed kernel word overriding the seeded weights"))
                .arg(Arg::new("full-range")
                    .long("full-range")
                    .help("Draw stimulus over the whole N-bit range")
                    .action(ArgAction::SetTrue))
                .arg(Arg::new("trace")
                    .long("trace")
                    .help("Print every cycle's state registers")
                    .action(ArgAction::SetTrue))
                .arg(Arg::new("report")
                    .short('r')
                    .long("report")
                    .value_name("FILE")
                    .help("Write the pass and parity reports as JSON"))
        )
        .subcommand(
            Command::new("sweep")
                .about("Check many seeded passes against the golden reference")
                .arg(config_arg())
                .arg(pool_type_arg())
                .arg(Arg::new("seeds")
                    .short('n')
                    .long("seeds")
                    .help("Number of seeds, starting at 0")
                    .default_value("64"))
                .arg(Arg::new("full-range")
                    .long("full-range")
                    .help("Draw stimulus over the whole N-bit range")
                    .action(ArgAction::SetTrue))
                .arg(Arg::new("report")
                    .short('r')
                    .long("report")
                    .value_name("FILE")
                    .help("Write the sweep summary as JSON"))
        )
        .subcommand(
            Command::new("golden")
                .about("Export the default golden reference vectors")
                .arg(config_arg())
                .arg(Arg::new("output")
                    .short('o')
                    .long("output")
                    .value_name("FILE")
                    .help("Output JSON file")
                    .default_value("golden/reference.json"))
        )
}

fn arg<'a>(matches: &'a ArgMatches, name: &str) -> Result<&'a String, Box<dyn Error>> {
    matches
        .get_one::<String>(name)
        .ok_or_else(|| format!("missing argument '{}'", name).into())
}

/// Load the configuration, falling back to the reference layer when the file is absent
fn load_config(matches: &ArgMatches) -> Result<LayerConfig, Box<dyn Error>> {
    let config_path = arg(matches, "config")?;
    if Path::new(config_path).exists() {
        Ok(LayerConfig::from_file(config_path)?)
    } else {
        info!("{} not found, using the reference configuration", config_path);
        Ok(LayerConfig::default_reference())
    }
}

fn stimulus_range(matches: &ArgMatches) -> StimulusRange {
    if matches.get_flag("full-range") {
        StimulusRange::FullRange
    } else {
        StimulusRange::Nominal
    }
}

fn cmd_validate(matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let config_path = arg(matches, "config")?;

    println!("Validating layer configuration: {}", config_path);

    match LayerConfig::from_file(config_path) {
        Ok(config) => {
            let g = &config.geometry;
            println!("✓ Configuration is valid");
            println!("  Format: {} ({} bits)", config.fixed_format(), config.format.width);
            println!("  Image: {0}x{0}, kernel: {1}x{1}, stride: {2}", g.image_size, g.kernel_size, g.stride);
            println!("  Conv map: {0}x{0}, pool: {1}x{1} ({2:?})", config.output_side(), g.pool_size, config.engine.pool_order);
            println!("  Pooled outputs per pass: {}", config.expected_outputs());
            println!("  Line buffer: {} samples, MAC lanes: {}", config.line_buffer_slots(), config.engine.mac_lanes);
            println!("✓ All validation checks passed");
        }
        Err(e) => {
            eprintln!("✗ Configuration validation failed: {}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn cmd_config_gen(matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let output_path = arg(matches, "output")?;

    println!("Generating reference layer configuration: {}", output_path);
    LayerConfig::default_reference().save_to_file(output_path)?;

    println!("✓ Configuration saved to {}", output_path);
    println!("  Use 'cnn-layer-sim validate -c {}' to verify", output_path);

    Ok(())
}

fn cmd_run(matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let config = load_config(matches)?;
    let pool_type: PoolType = arg(matches, "pool-type")?.parse()?;
    let seed: u64 = arg(matches, "seed")?.parse()?;
    let show_trace = matches.get_flag("trace");

    let mut stimulus = match stimulus_range(matches) {
        StimulusRange::Nominal => Stimulus::random(&config, seed),
        StimulusRange::FullRange => Stimulus::random_full_range(&config, seed),
    };
    if let Some(hex) = matches.get_one::<String>("weights") {
        let word = WeightWord::from_hex(hex, config.kernel_taps(), config.fixed_format())?;
        stimulus.weights = word.unpack();
    }

    let fmt = config.fixed_format();
    println!("Running one {} layer pass ({} pooling, seed {})", fmt, pool_type, seed);
    println!("  Weight word: 0x{}", stimulus.weight_word(&config).to_hex());

    let mut bench = Testbench::new(config.clone())?.with_trace(show_trace);
    let report = bench.run(&stimulus, pool_type)?;

    if show_trace {
        for t in &report.trace {
            println!(
                "  {:>4} {:?}/{:?}/{:?} conv={:?} pool_in={:?} out={:?}",
                t.cycle, t.layer, t.conv, t.pool, t.conv_out, t.pool_in, t.outputs
            );
        }
    }

    println!("\nOutputs:");
    for (i, &x) in report.outputs.iter().enumerate() {
        println!("  [{}] {:>8}  ({:.4})", i, x, fmt.to_real(x));
    }
    println!("\nTiming:");
    println!("  Done at cycle {} ({:.1} ns)", report.cycles, report.elapsed_ns);
    if let Some(first) = report.first_output_cycle {
        println!("  First output at cycle {}", first);
    }
    println!("  MAC operations: {}", report.stats.mac_operations);

    let reference = ReferenceData::compute(&config, stimulus, pool_type, "cli run");
    let parity = check_pass(&format!("seed_{}", seed), &reference, &report);
    if parity.passed {
        println!("✓ Matches the golden reference");
    } else {
        warn!("parity failure: {:?}", parity.error_message);
        println!("✗ Reference mismatch: {}", parity.error_message.as_deref().unwrap_or("unknown"));
    }

    if let Some(path) = matches.get_one::<String>("report") {
        let json = serde_json::json!({ "pass": &report, "parity": &parity });
        std::fs::write(path, serde_json::to_string_pretty(&json)?)?;
        println!("  Report written to {}", path);
    }

    if !parity.passed {
        std::process::exit(1);
    }
    Ok(())
}

fn cmd_sweep(matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let config = load_config(matches)?;
    let pool_type: PoolType = arg(matches, "pool-type")?.parse()?;
    let count: u64 = arg(matches, "seeds")?.parse()?;
    let seeds: Vec<u64> = (0..count).collect();

    println!("Sweeping {} seeds ({} pooling)", count, pool_type);
    let summary = run_seed_sweep(&config, &seeds, pool_type, stimulus_range(matches));

    println!("  Passed: {}/{} ({:.1}%)", summary.passed, summary.total, summary.pass_rate() * 100.0);
    println!("  Simulated cycles: {}", summary.total_cycles);
    for result in summary.results.iter().filter(|r| !r.passed) {
        println!("  ✗ {}: {}", result.test_name, result.error_message.as_deref().unwrap_or("unknown"));
    }

    if let Some(path) = matches.get_one::<String>("report") {
        summary.export(path)?;
        println!("  Summary written to {}", path);
    }

    if !summary.all_passed() {
        std::process::exit(1);
    }
    println!("✓ Sweep complete");
    Ok(())
}

fn cmd_golden(matches: &ArgMatches) -> Result<(), Box<dyn Error>> {
    let config = load_config(matches)?;
    let output_path = arg(matches, "output")?;

    let reference = GoldenReference::with_default_vectors(config);
    if let Some(parent) = Path::new(output_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    reference.export_references(output_path)?;

    println!("✓ {} reference vectors written to {}", reference.list_available_tests().len(), output_path);
    Ok(())
}
