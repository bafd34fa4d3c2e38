use anyhow::Context;
use clap::{Parser, Subcommand};
use sentrycam::camera::TestPatternSource;
use sentrycam::control::{Controller, StartOptions, StartOutcome};
use sentrycam::lock::LockProbe;
use sentrycam::mailbox::{self, MailboxReceiver};
use sentrycam::{daemon, viewer, SentrycamConfig};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "sentrycam")]
#[command(about = "Home surveillance backend with motion-triggered recording and live viewing")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "sentrycam.toml")]
    config: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, global = true)]
    debug: bool,

    /// Enable verbose logging (info level)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Override log format (json, pretty, compact)
    #[arg(long, global = true, value_name = "FORMAT")]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the capture service in the background
    Start {
        /// Camera device index to record from
        #[arg(long)]
        camera: Option<u32>,

        /// Skip the human/face detector pair
        #[arg(long)]
        no_human_detection: bool,

        /// Skip the motion detector
        #[arg(long)]
        no_motion_detection: bool,

        /// Do not draw detection outlines on recorded frames
        #[arg(long)]
        no_outlines: bool,
    },

    /// Stop the capture service
    Stop,

    /// Start the live viewer in the background
    Viewer,

    /// Stop the live viewer
    StopViewer,

    /// Report whether the services are running
    Status,

    /// Drain and print pending diagnostic messages from the services
    Messages,

    /// Validate the configuration file and exit
    ValidateConfig,

    /// Print the default configuration in TOML format and exit
    PrintConfig,

    /// Internal entry point of the detached capture service
    #[command(hide = true)]
    RunCapture {
        #[arg(long)]
        camera: Option<u32>,
        #[arg(long)]
        no_human_detection: bool,
        #[arg(long)]
        no_motion_detection: bool,
        #[arg(long)]
        no_outlines: bool,
    },

    /// Internal entry point of the detached viewer
    #[command(hide = true)]
    RunViewer,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if matches!(args.command, Command::PrintConfig) {
        let rendered = toml::to_string_pretty(&SentrycamConfig::default())
            .context("could not render the default configuration")?;
        println!("# Sentrycam configuration file");
        println!("# All values are optional; these are the defaults.");
        println!();
        print!("{}", rendered);
        return Ok(());
    }

    let config = SentrycamConfig::load_from_file(&args.config)
        .with_context(|| format!("failed to load configuration from {}", args.config))?;
    config.validate().context("invalid configuration")?;

    // The service entry points daemonize and switch to file logging; a
    // console subscriber would write into a closed terminal.
    let is_service = matches!(
        args.command,
        Command::RunCapture { .. } | Command::RunViewer
    );
    if !is_service {
        init_logging(&args);
    }

    let config_path = args.config.clone();
    match args.command {
        Command::RunCapture {
            camera,
            no_human_detection,
            no_motion_detection,
            no_outlines,
        } => {
            let mut config = config;
            if let Some(index) = camera {
                config.camera.index = index;
            }
            config.detection.enable_human &= !no_human_detection;
            config.detection.enable_motion &= !no_motion_detection;
            config.detection.enable_outlines &= !no_outlines;

            daemon::run_capture_service(config, |_config| {
                Ok(Box::new(TestPatternSource::new(15)))
            });
        }
        Command::RunViewer => {
            daemon::run_viewer_service(config, Box::new(viewer::HeadlessRenderer::new()));
        }
        command => run_control_command(command, config, &config_path),
    }

    Ok(())
}

fn run_control_command(command: Command, config: SentrycamConfig, config_path: &str) {
    let controller = Controller::new(config.clone(), config_path);

    match command {
        Command::Start {
            camera,
            no_human_detection,
            no_motion_detection,
            no_outlines,
        } => {
            let mut options = StartOptions::from_config(&config);
            if let Some(index) = camera {
                options.camera_index = index;
            }
            options.enable_human &= !no_human_detection;
            options.enable_motion &= !no_motion_detection;
            options.enable_outlines &= !no_outlines;

            match controller.start(&options) {
                Ok(StartOutcome::Started) => {
                    println!("Capture service started on camera {}", options.camera_index);
                }
                Ok(StartOutcome::AlreadyRunning) => {
                    println!("Capture service is already running");
                }
                Ok(StartOutcome::PermissionError) => {
                    eprintln!("Cannot create the lock file; check permissions");
                    std::process::exit(1);
                }
                Err(e) => {
                    error!("Start failed: {}", e);
                    eprintln!("Failed to start the capture service: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Command::Stop => {
            if controller.stop() {
                println!("Capture service asked to stop");
            } else {
                println!("Capture service is not running");
            }
        }

        Command::Viewer => match controller.start_viewer() {
            Ok(StartOutcome::Started) => println!("Viewer started"),
            Ok(StartOutcome::AlreadyRunning) => println!("Viewer is already running"),
            Ok(StartOutcome::PermissionError) => {
                eprintln!("Cannot create the lock file; check permissions");
                std::process::exit(1);
            }
            Err(e) => {
                error!("Viewer start failed: {}", e);
                eprintln!("Failed to start the viewer: {}", e);
                std::process::exit(1);
            }
        },

        Command::StopViewer => {
            if controller.stop_viewer() {
                println!("Viewer asked to stop");
            } else {
                println!("Viewer is not running");
            }
        }

        Command::Status => {
            print_status("capture service", controller.probe_capture());
            print_status("viewer", controller.probe_viewer());
        }

        Command::Messages => match MailboxReceiver::open(&config.service.mailbox_name) {
            Ok(receiver) => {
                let mut count = 0;
                let drained = receiver.on_messages(|message| {
                    count += 1;
                    match mailbox::classify(message) {
                        mailbox::DaemonIndication::Dead => {
                            println!("[service failure] {}", message)
                        }
                        mailbox::DaemonIndication::Verbatim => println!("{}", message),
                    }
                });
                if let Err(e) = drained {
                    eprintln!("Could not read diagnostic messages: {}", e);
                    std::process::exit(1);
                }
                if count == 0 {
                    println!("No pending messages");
                }
            }
            Err(e) => {
                eprintln!("Could not open the diagnostic mailbox: {}", e);
                std::process::exit(1);
            }
        },

        Command::ValidateConfig => {
            // Load and validate already ran; reaching this point means both
            // passed.
            info!("Configuration loaded from {}", config_path);
            println!("Configuration is valid");
        }

        Command::PrintConfig | Command::RunCapture { .. } | Command::RunViewer => {
            unreachable!("handled in main")
        }
    }
}

fn print_status(name: &str, probe: LockProbe) {
    match probe {
        LockProbe::Running(pid) => println!("{} is running (pid {})", name, pid),
        LockProbe::Starting => println!("{} is starting", name),
        LockProbe::NotRunning => println!("{} is not running", name),
    }
}

fn init_logging(args: &Args) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.verbose {
        "info"
    } else if args.quiet {
        "error"
    } else {
        "warn"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("sentrycam={}", log_level)));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer()
            .json()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        Some("compact") => fmt::layer()
            .compact()
            .with_target(false)
            .boxed(),
        Some("pretty") => fmt::layer()
            .pretty()
            .with_target(true)
            .with_file(args.debug)
            .with_line_number(args.debug)
            .boxed(),
        Some(format) => {
            eprintln!("Warning: Unknown log format '{}', using default", format);
            fmt::layer().with_target(false).boxed()
        }
        None => fmt::layer().with_target(false).boxed(),
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();
}
