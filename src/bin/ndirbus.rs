use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use ndirbus::calib::NdirCalib;
use ndirbus::monitor::run_sampler;
use ndirbus::power::PowerRail;
use ndirbus::{
    Launch, Monitor, Ndir, NdirConf, NdirError, Result, SharedRegion, SimDevice, SystemClock,
};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_MONITOR_INTERVAL: &str = "1";

#[tokio::main]
async fn main() {
    let matches = App::new("ndirbus")
        .version(env!("CARGO_PKG_VERSION"))
        .author("Sensor Systems Engineering Team")
        .about("🌫️  NDIR CO2 sensor driver - SPI command protocol, calibration and sampling")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("conf")
                .short("c")
                .long("conf")
                .value_name("FILE")
                .help("Sensor configuration JSON")
                .takes_value(true)
                .global(true),
        )
        .arg(
            Arg::with_name("simulate")
                .short("s")
                .long("simulate")
                .help("Use an in-memory simulated sensor instead of the SPI bus")
                .global(true),
        )
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["json", "table"])
                .default_value("json")
                .global(true),
        )
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .help("Log every transaction to stderr")
                .global(true),
        )
        .subcommand(SubCommand::with_name("status").about("📊 Watchdog flag, input voltage and uptime"))
        .subcommand(SubCommand::with_name("version").about("🏷️  Firmware ident and tag"))
        .subcommand(
            SubCommand::with_name("power").about("🔌 Switch the sensor supply").arg(
                Arg::with_name("state")
                    .help("Rail state")
                    .required(true)
                    .possible_values(&["on", "off"]),
            ),
        )
        .subcommand(SubCommand::with_name("reset").about("🔄 Force a watchdog reset"))
        .subcommand(
            SubCommand::with_name("calib")
                .about("🧪 Calibration EEPROM")
                .setting(AppSettings::SubcommandRequiredElseHelp)
                .subcommand(SubCommand::with_name("retrieve").about("Read the calibration from EEPROM"))
                .subcommand(
                    SubCommand::with_name("store")
                        .about("Write a calibration to EEPROM and reload it")
                        .arg(
                            Arg::with_name("default")
                                .long("default")
                                .help("Store the factory IAQ template")
                                .conflicts_with("file"),
                        )
                        .arg(
                            Arg::with_name("file")
                                .value_name("FILE")
                                .help("Calibration JSON")
                                .required_unless("default"),
                        )
                        .arg(
                            Arg::with_name("no-reload")
                                .long("no-reload")
                                .help("Leave the device on its current calibration"),
                        ),
                )
                .subcommand(
                    SubCommand::with_name("set")
                        .about("Set one calibration field on the device, or in a JSON file")
                        .arg(
                            Arg::with_name("file")
                                .long("file")
                                .value_name("FILE")
                                .help("Edit this calibration JSON instead of the device")
                                .takes_value(true),
                        )
                        .arg(
                            Arg::with_name("path")
                                .value_name("PATH")
                                .help("e.g. lamp-period, range-iaq.zero, range-safety")
                                .required(true),
                        )
                        .arg(
                            Arg::with_name("value")
                                .value_name("VALUE")
                                .help("JSON value, e.g. 1000, 0.25 or null")
                                .required(true),
                        ),
                )
                .subcommand(SubCommand::with_name("reload").about("Reload calibration from EEPROM")),
        )
        .subcommand(
            SubCommand::with_name("lamp")
                .about("💡 Lamp control")
                .arg(
                    Arg::with_name("state")
                        .help("Lamp state")
                        .required(true)
                        .possible_values(&["on", "off"]),
                )
                .arg(
                    Arg::with_name("level")
                        .long("level")
                        .value_name("VOLTS")
                        .help("Lamp drive voltage")
                        .takes_value(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("sample")
                .about("📈 Take one sample")
                .arg(Arg::with_name("raw").long("raw").help("Thermopile voltages instead of gas")),
        )
        .subcommand(
            SubCommand::with_name("measure")
                .about("📏 Instantaneous channel readings")
                .arg(Arg::with_name("calibrate").long("calibrate").help("Run the measure calibration first")),
        )
        .subcommand(
            SubCommand::with_name("recorder")
                .about("🎞️  Record and play back raw thermopile values")
                .arg(Arg::with_name("deferral").value_name("DEFERRAL_MS").required(true))
                .arg(Arg::with_name("interval").value_name("INTERVAL_MS").required(true))
                .arg(Arg::with_name("count").value_name("COUNT").required(true)),
        )
        .subcommand(
            SubCommand::with_name("monitor")
                .about("🛰️  Run the background sampler and report its rolling average")
                .arg(
                    Arg::with_name("interval")
                        .short("i")
                        .long("interval")
                        .value_name("SECONDS")
                        .help("Reporting interval")
                        .takes_value(true)
                        .default_value(DEFAULT_MONITOR_INTERVAL),
                ),
        )
        .subcommand(
            SubCommand::with_name("monitor-worker")
                .setting(AppSettings::Hidden)
                .about("Sampling loop, launched by monitor"),
        )
        .get_matches();

    init_tracing(global_flag(&matches, "verbose"));

    let format = global_value(&matches, "format").unwrap_or("json").to_string();

    let command = matches.subcommand_name().map(str::to_string);
    let result = match command.as_deref() {
        Some("monitor") => handle_monitor(&matches, &format).await,
        Some("monitor-worker") => handle_monitor_worker(&matches).await,
        _ => run_interruptible(matches, format).await,
    };

    if let Err(e) = result {
        eprintln!("{}", e.to_diagnostic());
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("ndirbus=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// A global option, taken from the innermost subcommand that saw it.
fn global_value<'a>(matches: &'a ArgMatches<'_>, name: &str) -> Option<&'a str> {
    let inner = match matches.subcommand() {
        (_, Some(sub)) => global_value(sub, name),
        _ => None,
    };
    inner.or_else(|| matches.value_of(name))
}

fn global_flag(matches: &ArgMatches<'_>, name: &str) -> bool {
    matches.is_present(name)
        || match matches.subcommand() {
            (_, Some(sub)) => global_flag(sub, name),
            _ => false,
        }
}

fn conf_path(matches: &ArgMatches<'_>) -> Option<PathBuf> {
    global_value(matches, "conf").map(PathBuf::from)
}

/// The configured sensor, or a powered simulated one.
fn open_ndir(conf: &NdirConf, simulate: bool) -> Result<Arc<dyn Ndir>> {
    if simulate {
        let device = SimDevice::new(conf.dialect()?, Arc::new(SystemClock::new()));
        device.rail().set(true)?;
        info!(model = %conf.model, "simulated sensor");
        return Ok(Arc::new(device.driver(conf.bus_lock(), conf.lock_name())));
    }

    Ok(Arc::new(conf.build()?))
}

fn load_conf(matches: &ArgMatches<'_>) -> Result<(NdirConf, bool)> {
    let conf = NdirConf::load_or_default(conf_path(matches).as_deref())?;
    let simulate = global_flag(matches, "simulate");
    debug!(?conf, simulate, "configuration");
    Ok((conf, simulate))
}

fn joined<T>(result: std::result::Result<Result<T>, JoinError>) -> Result<T> {
    result.unwrap_or_else(|e| Err(NdirError::Io(io::Error::new(io::ErrorKind::Other, e))))
}

/// Runs a one-shot command off the runtime. Ctrl-C lets the operation in
/// flight finish, so its session closes and the bus lock is released, then
/// exits quietly.
async fn run_interruptible(matches: ArgMatches<'static>, format: String) -> Result<()> {
    let mut work = tokio::task::spawn_blocking(move || run(&matches, &format));

    tokio::select! {
        result = &mut work => joined(result),
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted, finishing the current operation");
            let _ = work.await;
            Ok(())
        }
    }
}

fn run(matches: &ArgMatches<'_>, format: &str) -> Result<()> {
    let (conf, simulate) = load_conf(matches)?;

    if let ("calib", Some(sub)) = matches.subcommand() {
        if let ("set", Some(set)) = sub.subcommand() {
            if let Some(file) = set.value_of("file") {
                return handle_calib_file(set, Path::new(file), format);
            }
        }
    }

    let ndir = open_ndir(&conf, simulate)?;

    match matches.subcommand() {
        ("status", _) => emit(format, "Status", &ndir.status()?),
        ("version", _) => emit(format, "Version", &ndir.version()?),
        ("power", Some(sub)) => {
            let on = sub.value_of("state") == Some("on");
            if on {
                ndir.power_on()?;
            } else {
                ndir.power_off()?;
            }
            emit(format, "Power", &serde_json::json!({ "power": on }))
        }
        ("reset", _) => {
            let quarantine = ndir.reset()?;
            let remaining = quarantine.remaining(ndir.clock().now());
            emit(format, "Reset", &serde_json::json!({ "quarantine": remaining.as_secs_f64() }))
        }
        ("calib", Some(sub)) => handle_calib(sub, ndir.as_ref(), format)?,
        ("lamp", Some(sub)) => {
            if let Some(level) = sub.value_of("level") {
                ndir.lamp_level(parse_arg("level", level)?)?;
            }
            let on = sub.value_of("state") == Some("on");
            ndir.lamp_run(on)?;
            emit(format, "Lamp", &serde_json::json!({ "lamp": on }))
        }
        ("sample", Some(sub)) => {
            ndir.sample()?;
            let interval = ndir.sample_interval()?;
            ndir.clock().sleep(interval);

            if sub.is_present("raw") {
                emit(format, "Sample", &ndir.get_sample_voltage()?)
            } else {
                emit(format, "Sample", &ndir.get_sample_gas()?)
            }
        }
        ("measure", Some(sub)) => {
            if sub.is_present("calibrate") {
                ndir.measure_calibrate()?;
            }
            let raw = ndir.measure_raw()?;
            let voltage = ndir.measure_voltage()?;
            emit(format, "Measure", &serde_json::json!({ "raw": raw, "voltage": voltage }))
        }
        ("recorder", Some(sub)) => {
            let deferral = parse_arg("deferral", sub.value_of("deferral").unwrap_or_default())?;
            let interval = parse_arg("interval", sub.value_of("interval").unwrap_or_default())?;
            let count = parse_arg("count", sub.value_of("count").unwrap_or_default())?;

            for record in ndir.record_raw(deferral, interval, count)? {
                emit(format, "Record", &record);
            }
        }
        _ => {
            println!("{}", "Subcommand required. Use 'ndirbus --help' for options.".yellow());
        }
    }

    Ok(())
}

fn handle_calib(matches: &ArgMatches<'_>, ndir: &dyn Ndir, format: &str) -> Result<()> {
    match matches.subcommand() {
        ("retrieve", _) => emit(format, "Calibration", &ndir.retrieve_calib()?),
        ("store", Some(sub)) => {
            let calib = match sub.value_of("file") {
                Some(file) if !sub.is_present("default") => NdirCalib::load(file)?,
                _ => NdirCalib::default(),
            };

            let pending = ndir.store_calib(&calib)?;
            if sub.is_present("no-reload") {
                pending.discard();
            } else {
                pending.reload(ndir)?;
            }

            notice(format, "Calibration stored");
            emit(format, "Calibration", &calib);
        }
        ("set", Some(sub)) => {
            let mut calib = ndir.retrieve_calib()?;
            calib.set(sub.value_of("path").unwrap_or_default(), &field_value(sub))?;
            ndir.store_calib(&calib)?.reload(ndir)?;
            emit(format, "Calibration", &calib);
        }
        ("reload", _) => {
            ndir.reload_calib()?;
            notice(format, "Calibration reloaded");
        }
        _ => {}
    }
    Ok(())
}

/// VALUE as JSON, or as a bare string when it does not parse.
fn field_value(matches: &ArgMatches<'_>) -> serde_json::Value {
    let raw = matches.value_of("value").unwrap_or_default();
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn handle_calib_file(matches: &ArgMatches<'_>, file: &Path, format: &str) -> Result<()> {
    let mut calib = if file.exists() {
        NdirCalib::load(file)?
    } else {
        NdirCalib::default()
    };
    calib.set(matches.value_of("path").unwrap_or_default(), &field_value(matches))?;
    calib.save(file)?;

    emit(format, "Calibration", &calib);
    Ok(())
}

async fn handle_monitor(global: &ArgMatches<'_>, format: &str) -> Result<()> {
    let (conf, simulate) = load_conf(global)?;
    let matches = match global.subcommand() {
        (_, Some(sub)) => sub,
        _ => global,
    };

    let seconds: f64 = parse_arg("interval", matches.value_of("interval").unwrap_or(DEFAULT_MONITOR_INTERVAL))?;
    let ndir = open_ndir(&conf, simulate)?;
    let shared = Arc::new(SharedRegion::open(
        conf.shared_path(),
        conf.bus_lock(),
        conf.monitor_lock_name(),
    )?);

    // a simulated sensor only exists in this process
    let launch = if simulate {
        Launch::Thread
    } else {
        let mut command = ProcessCommand::new(std::env::current_exe()?);
        if let Some(path) = conf_path(global) {
            command.arg("--conf").arg(path);
        }
        command.arg("monitor-worker");
        Launch::Process(command)
    };

    let mut monitor = Monitor::new(ndir, shared, conf.monitor_settings(), launch);
    monitor.start()?;

    let mut ticker = tokio::time::interval(Duration::from_secs_f64(seconds.max(0.1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(sample) = monitor.sample()? {
                    emit(format, "Monitor", &sample);
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    monitor.stop()
}

/// The sampling loop of a monitor child. Stops on a request through the
/// shared region, or on Ctrl-C delivered to the whole process group.
async fn handle_monitor_worker(global: &ArgMatches<'_>) -> Result<()> {
    let (conf, simulate) = load_conf(global)?;
    let stop = Arc::new(AtomicBool::new(false));

    let mut work = {
        let stop = Arc::clone(&stop);
        tokio::task::spawn_blocking(move || {
            let ndir = open_ndir(&conf, simulate)?;
            let shared = SharedRegion::open(conf.shared_path(), conf.bus_lock(), conf.monitor_lock_name())?;
            run_sampler(ndir.as_ref(), &shared, conf.monitor_settings(), &stop)
        })
    };

    tokio::select! {
        result = &mut work => joined(result),
        _ = tokio::signal::ctrl_c() => {
            debug!("worker interrupted");
            stop.store(true, Ordering::SeqCst);
            joined(work.await)
        }
    }
}

fn parse_arg<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        NdirError::Configuration(ndirbus::ConfigurationError::InvalidValue {
            path: name.to_string(),
            value: value.to_string(),
        })
    })
}

/// Confirmation line for table output. JSON output stays one document per line.
fn notice(format: &str, message: &str) {
    if format == "table" {
        println!("{} {}", "✅".green(), message.bright_green());
    }
}

fn emit<T: Serialize>(format: &str, title: &str, value: &T) {
    let json = match serde_json::to_value(value) {
        Ok(json) => json,
        Err(e) => {
            eprintln!("{} {}", "❌".red(), e);
            return;
        }
    };

    match format {
        "table" => {
            println!("{} {}", "▶".bright_blue(), title.bright_blue().bold());
            let mut rows = Vec::new();
            flatten("", &json, &mut rows);
            let width = rows.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
            for (key, value) in rows {
                println!("  {:<width$}  {}", key.bright_white(), value.bright_cyan(), width = width);
            }
        }
        _ => println!("{}", json),
    }
}

fn flatten(prefix: &str, value: &serde_json::Value, rows: &mut Vec<(String, String)>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, value) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten(&path, value, rows);
            }
        }
        other => rows.push((prefix.to_string(), other.to_string())),
    }
}
