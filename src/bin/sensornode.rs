use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use sensornode::calibration::{ClockCalibrator, CorrectionFactor, SleepPlan};
use sensornode::config::{NodeConfig, NodeRole, SchedulingMode};
use sensornode::payload::{JsonPayloadEncoder, PayloadEncoder, SensorSample};
use sensornode::radio::{time_on_air_us, TransferOutcome};
use sensornode::scheduler::{CycleReport, DutyCycleScheduler};
use sensornode::sim::{
    validate_timer_rate, SimBoard, SimBoardOptions, SimClock, SimDelay, SimFrame, SimReferenceClock,
};
use std::error::Error;
use std::fmt::Display;
use std::process;
use std::str::FromStr;
use tracing::{error, info, Level};

fn main() {
    let matches = App::new("sensornode")
        .version("0.1.0")
        .about("LoRa sensor node duty cycle on a simulated board")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log debug output")
                .global(true),
        )
        .arg(
            Arg::with_name("quiet")
                .short("q")
                .long("quiet")
                .help("Log warnings and errors only")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("run")
                .about("Boot the node and run duty cycles")
                .arg(
                    Arg::with_name("config")
                        .short("c")
                        .long("config")
                        .value_name("FILE")
                        .help("JSON node configuration")
                        .takes_value(true),
                )
                .arg(
                    Arg::with_name("cycles")
                        .short("n")
                        .long("cycles")
                        .value_name("N")
                        .takes_value(true)
                        .default_value("3"),
                )
                .arg(
                    Arg::with_name("mode")
                        .long("mode")
                        .takes_value(true)
                        .possible_values(&["polling", "interrupt"]),
                )
                .arg(
                    Arg::with_name("role")
                        .long("role")
                        .takes_value(true)
                        .possible_values(&["transmitter", "receiver"]),
                )
                .arg(timer_rate_arg())
                .arg(
                    Arg::with_name("no-reference")
                        .long("no-reference")
                        .help("Board without a working RTC"),
                )
                .arg(
                    Arg::with_name("inbound")
                        .long("inbound")
                        .value_name("N")
                        .help("Packets queued on the air for a receiver")
                        .takes_value(true)
                        .default_value("0"),
                )
                .arg(
                    Arg::with_name("format")
                        .short("f")
                        .long("format")
                        .takes_value(true)
                        .possible_values(&["json", "table"])
                        .default_value("table"),
                ),
        )
        .subcommand(
            SubCommand::with_name("calibrate")
                .about("Measure the correction factor of a drifting timer")
                .arg(timer_rate_arg())
                .arg(
                    Arg::with_name("busy-wait")
                        .long("busy-wait")
                        .value_name("MS")
                        .takes_value(true)
                        .default_value("8000"),
                )
                .arg(
                    Arg::with_name("target")
                        .long("target")
                        .value_name("TICKS")
                        .takes_value(true)
                        .default_value("7980"),
                ),
        )
        .subcommand(
            SubCommand::with_name("sleep-plan")
                .about("Compute a corrected sleep duration")
                .arg(
                    Arg::with_name("factor")
                        .long("factor")
                        .takes_value(true)
                        .required(true),
                )
                .arg(
                    Arg::with_name("interval")
                        .long("interval")
                        .value_name("MS")
                        .takes_value(true)
                        .default_value("10000"),
                )
                .arg(
                    Arg::with_name("offset")
                        .long("offset")
                        .value_name("MS")
                        .takes_value(true)
                        .default_value("8"),
                ),
        )
        .subcommand(
            SubCommand::with_name("payload")
                .about("Encode a sample and estimate its time on air")
                .arg(
                    Arg::with_name("temperature")
                        .long("temperature")
                        .takes_value(true)
                        .allow_hyphen_values(true)
                        .default_value("21.5"),
                )
                .arg(Arg::with_name("humidity").long("humidity").takes_value(true).default_value("45.12"))
                .arg(Arg::with_name("pressure").long("pressure").takes_value(true).default_value("101320"))
                .arg(Arg::with_name("vcc").long("vcc").takes_value(true).default_value("3300"))
                .arg(Arg::with_name("node").long("node").takes_value(true).default_value("NS001")),
        )
        .get_matches();

    let level = if matches.is_present("verbose") {
        Level::DEBUG
    } else if matches.is_present("quiet") {
        Level::WARN
    } else {
        Level::INFO
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    let result = match matches.subcommand() {
        ("run", Some(m)) => handle_run(m),
        ("calibrate", Some(m)) => handle_calibrate(m),
        ("sleep-plan", Some(m)) => handle_sleep_plan(m),
        ("payload", Some(m)) => handle_payload(m),
        _ => Ok(()),
    };

    if let Err(e) = result {
        error!("Fatal: {}", e);
        eprintln!("{} {}", "error:".bright_red().bold(), e);
        process::exit(1);
    }
}

fn timer_rate_arg() -> Arg<'static, 'static> {
    Arg::with_name("timer-rate")
        .long("timer-rate")
        .value_name("RATE")
        .help("RC oscillator speed relative to real time, e.g. 1.025")
        .takes_value(true)
        .default_value("1.0")
}

fn arg<T>(matches: &ArgMatches<'_>, name: &str) -> Result<T, String>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = matches
        .value_of(name)
        .ok_or_else(|| format!("missing --{name}"))?;
    raw.parse()
        .map_err(|e| format!("invalid --{name} '{raw}': {e}"))
}

fn handle_run(matches: &ArgMatches<'_>) -> Result<(), Box<dyn Error>> {
    let mut config = match matches.value_of("config") {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    match matches.value_of("mode") {
        Some("interrupt") => config.mode = SchedulingMode::InterruptDriven,
        Some("polling") => config.mode = SchedulingMode::Polling,
        _ => {}
    }
    match matches.value_of("role") {
        Some("receiver") => config.role = NodeRole::Receiver,
        Some("transmitter") => config.role = NodeRole::Transmitter,
        _ => {}
    }

    let cycles: u32 = arg(matches, "cycles")?;
    let inbound: u32 = arg(matches, "inbound")?;
    let options = SimBoardOptions {
        timer_rate: arg(matches, "timer-rate")?,
        reference_available: !matches.is_present("no-reference"),
        ..SimBoardOptions::default()
    };

    let (board, mut parts) = SimBoard::build(&config, &options)?;
    if inbound > 0 {
        let frame = JsonPayloadEncoder.encode(&options.sample, options.vref_mv, "GW-SIM")?;
        for _ in 0..inbound {
            parts.radio.push_inbound(SimFrame::new(frame.to_vec()));
        }
    }

    let mut scheduler = DutyCycleScheduler::new(parts, config)?;
    scheduler.boot()?;
    let reports = scheduler.run(cycles)?;

    if matches.value_of("format") == Some("json") {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }

    println!("{}", "Sensor node duty cycle".bright_blue().bold());
    for report in &reports {
        print_report(report);
    }

    let stats = scheduler.stats();
    println!();
    println!("{} {}", "Cycles:".bright_white(), stats.cycles);
    println!(
        "{} {} ok / {} failed",
        "Transmissions:".bright_white(),
        stats.transmissions_ok.to_string().green(),
        stats.transmissions_failed.to_string().red()
    );
    println!(
        "{} {} ok / {} failed",
        "Receptions:".bright_white(),
        stats.receptions_ok.to_string().green(),
        stats.receptions_failed.to_string().red()
    );
    println!(
        "{} {} ({} skipped), {} ms requested",
        "Sleeps:".bright_white(),
        stats.sleeps,
        stats.skipped_sleeps,
        stats.total_sleep_ms
    );
    println!(
        "{} {:.5}",
        "Correction factor:".bright_white(),
        scheduler.node().calibrator().factor().value()
    );
    println!("{} {} ms", "Virtual time:".bright_white(), board.clock.now_ms());

    let violations = board.probe.violations();
    if violations.is_empty() {
        println!("{} {}", "Bus:".bright_white(), "exclusive selection held".green());
    } else {
        for v in &violations {
            println!("{} {}", "Bus violation:".bright_red(), v);
        }
    }
    Ok(())
}

fn print_report(report: &CycleReport) {
    let completed = match report.completed {
        Some(TransferOutcome::Success) => "success".green(),
        Some(outcome) => format!("{outcome:?}").to_lowercase().red(),
        None => "-".dimmed(),
    };
    let sleep = match report.sleep {
        Some(SleepPlan::Sleep { ms }) => format!("slept {ms} ms"),
        Some(SleepPlan::Skip { corrected_ms }) => format!("sleep skipped ({corrected_ms} ms)"),
        None => "no sleep".to_string(),
    };
    println!(
        "  #{:<3} {:<12} vcc {} mV, {} bytes, {}",
        report.cycle,
        completed,
        report.vcc_mv,
        report.payload.len(),
        sleep
    );
    if let Some(link) = report.link {
        println!(
            "       RSSI {:.1} dBm, SNR {:.2} dB, frequency error {:.0} Hz",
            link.rssi_dbm, link.snr_db, link.frequency_error_hz
        );
    }
}

fn handle_calibrate(matches: &ArgMatches<'_>) -> Result<(), Box<dyn Error>> {
    let rate = validate_timer_rate(arg(matches, "timer-rate")?)?;
    let busy_wait_ms: u32 = arg(matches, "busy-wait")?;
    let target: f64 = arg(matches, "target")?;

    let clock = SimClock::new();
    let mut delay = SimDelay::new(clock.clone());
    let mut calibrator =
        ClockCalibrator::with_busy_wait(SimReferenceClock::new(clock, rate), busy_wait_ms);
    calibrator.calibrate(&mut delay, target);

    let defaults = NodeConfig::default();
    let plan = calibrator.plan_sleep(defaults.sleep_interval_ms, defaults.wake_latency_offset_ms);
    info!("Calibration finished in state {:?}", calibrator.state());

    println!("{} {:.5}", "Correction factor:".bright_white(), calibrator.factor().value());
    println!(
        "{} {:?} for a {} ms interval",
        "Sleep plan:".bright_white(),
        plan,
        defaults.sleep_interval_ms
    );
    Ok(())
}

fn handle_sleep_plan(matches: &ArgMatches<'_>) -> Result<(), Box<dyn Error>> {
    let value: f64 = arg(matches, "factor")?;
    let factor = CorrectionFactor::new(value).ok_or("correction factor must be finite and positive")?;
    let interval: u32 = arg(matches, "interval")?;
    let offset: u32 = arg(matches, "offset")?;

    let corrected = factor.corrected_sleep_duration(interval, offset);
    match SleepPlan::from_corrected(corrected) {
        SleepPlan::Sleep { ms } => println!("{} {} ms", "Sleep".green(), ms),
        SleepPlan::Skip { corrected_ms } => {
            println!("{} (corrected duration {} ms)", "Skip low power".yellow(), corrected_ms);
        }
    }
    Ok(())
}

fn handle_payload(matches: &ArgMatches<'_>) -> Result<(), Box<dyn Error>> {
    let sample = SensorSample {
        temperature_c: arg(matches, "temperature")?,
        humidity_rh: arg(matches, "humidity")?,
        pressure_pa: arg(matches, "pressure")?,
    };
    let vcc: i32 = arg(matches, "vcc")?;
    let node = matches.value_of("node").unwrap_or("NS001");

    let payload = JsonPayloadEncoder.encode(&sample, vcc, node)?;
    let radio = NodeConfig::default().radio;
    println!("{}", String::from_utf8_lossy(&payload));
    println!(
        "{} bytes, {:.1} ms on air at SF{} / {} kHz",
        payload.len(),
        time_on_air_us(&radio, payload.len()) as f64 / 1000.0,
        radio.spreading_factor,
        radio.bandwidth_khz
    );
    if payload.len() <= radio.max_frame_len {
        println!("{}", "Fits in one frame".green());
    } else {
        println!("{} ({} byte limit)", "Too large for one frame".red(), radio.max_frame_len);
    }
    Ok(())
}
