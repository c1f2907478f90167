use clap::{Args, Parser, Subcommand, ValueEnum};
use rperf2::config::{parse_rate, parse_size, DEFAULT_PORT};
use rperf2::error::{EXIT_ABNORMAL, EXIT_OK};
use rperf2::report::{run_reporter_task, Reporter};
use rperf2::{Client, Config, Error, OutputFormat, Protocol, Server};
use std::net::IpAddr;
use std::process::ExitCode;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rperf2")]
#[command(about = "Network throughput testing in the style of iperf2", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run in server mode
    Server {
        /// Bind to specific address
        #[arg(short = 'B', long)]
        bind: Option<IpAddr>,

        /// Stop listening after this many seconds
        #[arg(short = 't', long)]
        time: Option<f64>,

        #[command(flatten)]
        common: CommonArgs,
    },

    /// Run in client mode
    Client {
        /// Server address to connect to
        server: String,

        /// Test duration in seconds
        #[arg(short = 't', long, conflicts_with = "bytes")]
        time: Option<f64>,

        /// Bytes to send per stream instead of a duration (K/M/G suffixes)
        #[arg(short = 'n', long, value_parser = parse_size_arg)]
        bytes: Option<u64>,

        /// Target bandwidth in bits/sec per stream (UDP; k/m/g suffixes)
        #[arg(short = 'b', long, value_parser = parse_rate_arg)]
        bandwidth: Option<u64>,

        /// Number of parallel streams
        #[arg(short = 'P', long, default_value = "1")]
        parallel: usize,

        /// Disable Nagle's algorithm
        #[arg(short = 'N', long)]
        no_delay: bool,

        /// FIN datagrams sent at the end of a UDP stream
        #[arg(long, default_value = "10")]
        fin_burst: u32,

        /// Connect timeout in seconds
        #[arg(long, default_value = "10")]
        connect_timeout: f64,

        #[command(flatten)]
        common: CommonArgs,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// Port to listen on or connect to
    #[arg(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Use UDP instead of TCP
    #[arg(short, long)]
    udp: bool,

    /// Read/write buffer length in bytes (K/M/G suffixes)
    #[arg(short = 'l', long, value_parser = parse_size_arg)]
    len: Option<u64>,

    /// Socket buffer size (TCP window) in bytes (K/M/G suffixes)
    #[arg(short = 'w', long, value_parser = parse_size_arg)]
    window: Option<u64>,

    /// Seconds between periodic reports
    #[arg(short, long, default_value = "1")]
    interval: f64,

    /// Report style: human, C (CSV) or json
    #[arg(
        short = 'y',
        long = "reportstyle",
        value_enum,
        ignore_case = true,
        default_value = "human"
    )]
    format: FormatArg,

    /// Late UDP datagrams within this many sequence numbers are reordered, not lost
    #[arg(long, default_value = "3")]
    reorder_window: u32,

    /// Server: end a stream silent for this many seconds
    #[arg(long, default_value = "10")]
    idle_timeout: f64,
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Human,
    #[value(alias = "c")]
    Csv,
    Json,
}

impl From<FormatArg> for OutputFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Human => OutputFormat::Human,
            FormatArg::Csv => OutputFormat::Csv,
            FormatArg::Json => OutputFormat::Json,
        }
    }
}

fn parse_size_arg(s: &str) -> Result<u64, String> {
    parse_size(s).map_err(|e| e.to_string())
}

fn parse_rate_arg(s: &str) -> Result<u64, String> {
    parse_rate(s).map_err(|e| e.to_string())
}

fn seconds(value: f64, what: &str) -> Result<Duration, Error> {
    Duration::try_from_secs_f64(value)
        .map_err(|_| Error::Config(format!("invalid {}: {}", what, value)))
}

impl CommonArgs {
    fn apply(&self, mut config: Config) -> Result<Config, Error> {
        if self.udp {
            config = config.with_protocol(Protocol::Udp);
        }
        if let Some(len) = self.len {
            config = config.with_buffer_size(len as usize);
        }
        if let Some(window) = self.window {
            config = config.with_window_size(window as usize);
        }
        Ok(config
            .with_interval(seconds(self.interval, "interval")?)
            .with_format(self.format.into())
            .with_reorder_window(self.reorder_window)
            .with_idle_timeout(seconds(self.idle_timeout, "idle timeout")?))
    }
}

fn build_config(command: &Commands) -> Result<Config, Error> {
    match command {
        Commands::Server { bind, time, common } => {
            let mut config = common.apply(Config::server(common.port))?;
            config.bind_addr = *bind;
            if let Some(time) = time {
                config = config.with_run_limit(seconds(*time, "run time")?);
            }
            Ok(config)
        }
        Commands::Client {
            server,
            time,
            bytes,
            bandwidth,
            parallel,
            no_delay,
            fin_burst,
            connect_timeout,
            common,
        } => {
            let mut config = common
                .apply(Config::client(server.clone(), common.port))?
                .with_parallel(*parallel)
                .with_no_delay(*no_delay)
                .with_fin_burst(*fin_burst)
                .with_connect_timeout(seconds(*connect_timeout, "connect timeout")?);
            if let Some(time) = time {
                config = config.with_duration(seconds(*time, "duration")?);
            }
            if let Some(bytes) = bytes {
                config = config.with_bytes(*bytes);
            }
            if let Some(bandwidth) = bandwidth {
                config = config.with_bandwidth(*bandwidth);
            }
            Ok(config)
        }
    }
}

async fn run(command: Commands, reporter: Reporter) -> Result<u8, Error> {
    let config = build_config(&command)?;
    match command {
        Commands::Server { .. } => {
            let server = Server::new(config)?.with_reporter(reporter);
            let cancel = server.cancellation_token().clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::info!("interrupted, shutting down");
                    cancel.cancel();
                }
            });
            server.run().await?;
            Ok(EXIT_OK)
        }
        Commands::Client { .. } => {
            let client = Client::new(config)?.with_reporter(reporter);
            let cancel = client.cancellation_token().clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    log::info!("interrupted, stopping streams");
                    cancel.cancel();
                }
            });
            let result = client.run().await?;
            Ok(if result.partial { EXIT_ABNORMAL } else { EXIT_OK })
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let format = match build_config(&cli.command) {
        Ok(config) => config.format,
        Err(e) => {
            eprintln!("rperf2: {}", e);
            return ExitCode::from(e.exit_code());
        }
    };

    let (reporter, receiver) = Reporter::new();
    let output = tokio::spawn(run_reporter_task(receiver, format, tokio::io::stdout()));

    // run() owns the last reporter handle; the output task ends once it returns
    let code = match run(cli.command, reporter).await {
        Ok(code) => code,
        Err(e) => {
            log::error!("{}", e);
            e.exit_code()
        }
    };

    match output.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("failed to write report: {:#}", anyhow::Error::from(e)),
        Err(e) => log::error!("report task failed: {}", e),
    }
    ExitCode::from(code)
}
