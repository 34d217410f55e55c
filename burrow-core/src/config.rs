//! resolver configs

pub mod cli {
    //! Parse from either cli or env var

    /// default DNS port
    pub const DEFAULT_PORT: u16 = 53;
    /// Default tcp accept pool size per listener
    pub const DEFAULT_INCOMING_NUM_TCP: usize = 10;
    /// Max in-flight mesh states -- Changing this value will affect memory
    /// usage. Past the bound, new clients get SERVFAIL and intake is paused
    /// until enough states drain.
    pub const DEFAULT_MAX_STATES: usize = 1024;
    /// Default message buffer size, fits the largest response we serve
    pub const DEFAULT_MSG_BUFFER_SIZE: usize = 65552;
    /// Default channel size for mpsc chans
    pub const DEFAULT_CHANNEL_SIZE: usize = 10_000;
    /// tokio worker thread name
    pub static DEFAULT_THREAD_NAME: &str = "burrow-worker";
    /// default log level. Can use this argument or BURROW_LOG env var
    pub const DEFAULT_BURROW_LOG: &str = "info";

    pub use clap::Parser;

    #[derive(Parser, Debug, Clone, PartialEq, Eq)]
    #[clap(author, name = "burrow", bin_name = "burrow", about, long_about = None)]
    /// parses from cli & environment var
    pub struct Config {
        /// port all listening sockets bind
        #[clap(short, long, env, value_parser, default_value_t = DEFAULT_PORT)]
        pub port: u16,
        /// serve IPv4 clients
        #[clap(long, env, action = clap::ArgAction::Set, default_value_t = true)]
        pub do_ip4: bool,
        /// serve IPv6 clients
        #[clap(long, env, action = clap::ArgAction::Set, default_value_t = true)]
        pub do_ip6: bool,
        /// answer queries over udp
        #[clap(long, env, action = clap::ArgAction::Set, default_value_t = true)]
        pub do_udp: bool,
        /// answer queries over tcp
        #[clap(long, env, action = clap::ArgAction::Set, default_value_t = true)]
        pub do_tcp: bool,
        /// bind the wildcard addresses and detect each packet's destination
        /// address instead of binding per interface; needs both families
        #[clap(long, env, action = clap::ArgAction::Set, default_value_t = false)]
        pub if_automatic: bool,
        /// numeric ip addresses to listen on; loopback when empty
        #[clap(long = "interface", env, value_parser)]
        pub interface: Vec<String>,
        /// tcp accept pool size; 0 disables tcp
        #[clap(long, env, value_parser, default_value_t = DEFAULT_INCOMING_NUM_TCP)]
        pub incoming_num_tcp: usize,
        /// max in-flight mesh states before new clients are answered SERVFAIL
        #[clap(long, env, value_parser, default_value_t = DEFAULT_MAX_STATES)]
        pub max_states: usize,
        /// size of the shared response buffer
        #[clap(long, env, value_parser, default_value_t = DEFAULT_MSG_BUFFER_SIZE)]
        pub msg_buffer_size: usize,
        /// channel size for various mpsc chans
        #[clap(long, env, value_parser, default_value_t = DEFAULT_CHANNEL_SIZE)]
        pub channel_size: usize,
        /// Worker thread name
        #[clap(long, env, value_parser, default_value = DEFAULT_THREAD_NAME)]
        pub thread_name: String,
        /// number of runtime worker threads; default is num logical CPUs
        #[clap(long, env, value_parser)]
        pub threads: Option<usize>,
        /// set the log level. All valid RUST_LOG arguments are accepted
        #[clap(long, env, value_parser, default_value = DEFAULT_BURROW_LOG)]
        pub burrow_log: String,
    }

    impl Default for Config {
        fn default() -> Self {
            Self {
                port: DEFAULT_PORT,
                do_ip4: true,
                do_ip6: true,
                do_udp: true,
                do_tcp: true,
                if_automatic: false,
                interface: Vec::new(),
                incoming_num_tcp: DEFAULT_INCOMING_NUM_TCP,
                max_states: DEFAULT_MAX_STATES,
                msg_buffer_size: DEFAULT_MSG_BUFFER_SIZE,
                channel_size: DEFAULT_CHANNEL_SIZE,
                thread_name: DEFAULT_THREAD_NAME.into(),
                threads: None,
                burrow_log: DEFAULT_BURROW_LOG.into(),
            }
        }
    }

    impl Config {
        /// are we bound to the default DNS port?
        pub fn is_default_port(&self) -> bool {
            self.port == DEFAULT_PORT
        }
    }

}

pub mod trace {
    //! tracing configuration
    use anyhow::Result;
    use tracing_subscriber::{
        filter::EnvFilter,
        fmt::{
            self,
            format::{Format, PrettyFields},
        },
        layer::SubscriberExt,
        util::SubscriberInitExt,
    };

    /// log as "json" or "standard" (unstructured)
    static DEFAULT_LOG_FORMAT: &str = "standard";

    /// Configuration for log output
    #[derive(Debug)]
    pub struct Config {
        /// formatting to apply to logs
        pub log_frmt: String,
    }

    impl Config {
        /// Install the subscriber. Log level comes from BURROW_LOG, the
        /// format from LOG_FORMAT.
        pub fn parse(burrow_log: &str) -> Result<Self> {
            let log_frmt =
                std::env::var("LOG_FORMAT").unwrap_or_else(|_| DEFAULT_LOG_FORMAT.to_owned());

            let filter =
                EnvFilter::try_new(burrow_log).or_else(|_| EnvFilter::try_new("info"))?;

            match &log_frmt[..] {
                "json" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer().json())
                        .init();
                }
                "pretty" => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(
                            fmt::layer()
                                .event_format(
                                    Format::default().pretty().with_source_location(false),
                                )
                                .fmt_fields(PrettyFields::new()),
                        )
                        .init();
                }
                _ => {
                    tracing_subscriber::registry()
                        .with(filter)
                        .with(fmt::layer())
                        .init();
                }
            }

            Ok(Self { log_frmt })
        }
    }
}
