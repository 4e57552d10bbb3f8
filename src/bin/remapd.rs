use clap::{ArgAction, Parser, Subcommand};
use log::{Level, LevelFilter, Metadata, Record};
use remapd::daemon::{self, Daemon};
use remapd::ipc::{self, Message, MsgType, MAX_MESSAGE_SIZE};
use remapd::keys;
use std::io::Read;
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "remapd",
    version = env!("CARGO_PKG_VERSION"),
    about = "A key remapping daemon",
    subcommand_required = true
)]
struct App {
    /// Increase message verbosity
    #[arg(long, short, action = ArgAction::Count, global = true, conflicts_with = "quiet")]
    verbose: u8,

    /// Silence all warnings
    #[arg(long, short, global = true, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the remapping daemon
    Daemon {
        /// Directory scanned for *.conf files
        #[arg(long = "config-dir", short = 'c')]
        config_dir: Option<PathBuf>,
    },

    /// Print key events from all input devices in real time
    Monitor {
        /// Prefix each event with a millisecond timestamp
        #[arg(long, short)]
        timestamps: bool,
    },

    /// Print a list of valid key names
    ListKeys,

    /// Parse the configuration directory and report errors
    Check {
        #[arg(long = "config-dir", short = 'c')]
        config_dir: Option<PathBuf>,
    },

    /// Trigger a configuration reload in the running daemon
    Reload,

    /// Stream layer state changes of the running daemon to stdout
    Listen,

    /// Add bindings to all loaded configs
    Bind {
        /// Binding expressions like 'capslock = esc'
        #[arg(required = true)]
        expressions: Vec<String>,
    },

    /// Type literal text through the virtual keyboard
    Input {
        /// Text to type; read from stdin when omitted
        text: Vec<String>,

        /// Inter-key delay in microseconds
        #[arg(long, short, default_value_t = 0)]
        timeout: u64,
    },

    /// Execute a macro expression
    #[command(name = "do")]
    Do {
        /// Macro text; read from stdin when omitted
        exprs: Vec<String>,

        /// Inter-step delay in microseconds
        #[arg(long, short, default_value_t = 0)]
        timeout: u64,
    },
}

fn ipc_exec(con: &mut std::os::unix::net::UnixStream, msg: Message) -> i32 {
    if let Err(e) = msg.write_to(con) {
        eprintln!("error: {e}");
        return 1;
    }

    match Message::read_from(con) {
        Ok(Some(reply)) => {
            if !reply.data.is_empty() {
                println!("{}", String::from_utf8_lossy(&reply.data));
            }
            i32::from(reply.msg_type == MsgType::Fail)
        }
        _ => {
            eprintln!("error: daemon closed the connection");
            1
        }
    }
}

fn connect() -> Result<std::os::unix::net::UnixStream, i32> {
    ipc::connect().map_err(|e| {
        eprintln!("error: {}: {e} (is the daemon running?)", ipc::socket_path().display());
        1
    })
}

fn stdin_or_args(args: Vec<String>) -> String {
    if args.is_empty() {
        let mut buf = String::new();
        let _ = std::io::stdin().read_to_string(&mut buf);
        buf
    } else {
        args.join(" ")
    }
}

fn list_keys() {
    let table = keys::keycode_table();

    for (code, ent) in table.iter().enumerate().take(keys::PHYS_KEY_COUNT as usize) {
        print!("key_{code:03}: ");
        if let Some(name) = ent.name {
            print!("'{name}'");
        }
        if let Some(alt) = ent.alt_name {
            print!(" or '{alt}'");
        }
        if let Some(shifted) = ent.shifted_name {
            print!(" (shifted '{shifted}')");
        }
        println!();
    }

    for (code, ent) in table.iter().enumerate().skip(keys::PHYS_KEY_COUNT as usize) {
        if let Some(name) = ent.name {
            print!("special: '{name}'");
            if let Some(alt) = ent.alt_name {
                print!(" or '{alt}'");
            }
            println!(" (key_{code})");
        }
    }
}

fn listen() -> i32 {
    let mut con = match connect() {
        Ok(con) => con,
        Err(code) => return code,
    };

    if let Err(e) = Message::new(MsgType::LayerListen, 0, Vec::new()).write_to(&mut con) {
        eprintln!("error: {e}");
        return 1;
    }

    let mut buf = [0u8; 512];
    loop {
        match con.read(&mut buf) {
            Ok(0) | Err(_) => return 0,
            Ok(n) => {
                print!("{}", String::from_utf8_lossy(&buf[..n]));
                use std::io::Write;
                let _ = std::io::stdout().flush();
            }
        }
    }
}

fn main() {
    let args = App::parse();

    log::set_logger(&CLI_LOGGER).unwrap();

    let level = if args.quiet {
        LevelFilter::Error
    } else {
        match args.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    };

    log::set_max_level(level);

    let code = match args.command {
        Commands::Daemon { config_dir } => match Daemon::run(config_dir) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("error: {e}");
                1
            }
        },
        Commands::Monitor { timestamps } => match daemon::monitor(timestamps) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("error: {e}");
                1
            }
        },
        Commands::ListKeys => {
            list_keys();
            0
        }
        Commands::Check { config_dir } => {
            let dir = config_dir.unwrap_or_else(|| PathBuf::from(daemon::DEFAULT_CONFIG_DIR));
            if daemon::check_configs(&dir) {
                0
            } else {
                1
            }
        }
        Commands::Reload => match connect() {
            Ok(mut con) => ipc_exec(&mut con, Message::new(MsgType::Reload, 0, Vec::new())),
            Err(code) => code,
        },
        Commands::Listen => listen(),
        Commands::Bind { expressions } => match connect() {
            Ok(mut con) => {
                let mut ret = 0;
                for expr in expressions {
                    if expr.len() > MAX_MESSAGE_SIZE {
                        eprintln!("error: expression too long");
                        ret = 1;
                        continue;
                    }
                    if ipc_exec(&mut con, Message::new(MsgType::Bind, 0, expr.into_bytes())) != 0 {
                        ret = 1;
                    }
                }
                if ret == 0 {
                    println!("success");
                }
                ret
            }
            Err(code) => code,
        },
        Commands::Input { text, timeout } => match connect() {
            Ok(mut con) => {
                let text = stdin_or_args(text);
                ipc_exec(&mut con, Message::new(MsgType::Input, timeout, text.into_bytes()))
            }
            Err(code) => code,
        },
        Commands::Do { exprs, timeout } => match connect() {
            Ok(mut con) => {
                let text = stdin_or_args(exprs);
                ipc_exec(&mut con, Message::new(MsgType::Macro, timeout, text.into_bytes()))
            }
            Err(code) => code,
        },
    };

    std::process::exit(code);
}

static CLI_LOGGER: CliLogger = CliLogger;

struct CliLogger;

impl log::Log for CliLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            eprintln!(
                "{}: {}",
                match record.level() {
                    Level::Error => "error",
                    Level::Warn => "warning",
                    Level::Info => "info",
                    Level::Debug => "debug",
                    Level::Trace => "trace",
                },
                record.args()
            );
        }
    }

    fn flush(&self) {}
}
