use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, builder::BoolishValueParser};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use peekserve::{PipelineConfig, RawOptions, server};

#[derive(Parser, Debug)]
#[command(name = "peekserve")]
#[command(about = "Serve a directory over HTTP, log every request, and simulate a flaky network")]
#[command(version)]
struct Cli {
    /// Port to listen on (1-65535), or where --port-dynamic starts searching
    #[arg(long, env = "PORT", value_name = "PORT", allow_hyphen_values = true)]
    port: Option<String>,

    /// Use the first free port at or above --port
    #[arg(long, env = "PORT_DYNAMIC", value_parser = BoolishValueParser::new())]
    port_dynamic: bool,

    /// Do not serve files or directory listings
    #[arg(long)]
    disable_static: bool,

    /// Status code for unmatched requests (100-999)
    #[arg(long, value_name = "CODE", allow_hyphen_values = true)]
    status: Option<String>,

    /// Literal body for unmatched requests
    #[arg(long, value_name = "BODY", allow_hyphen_values = true)]
    response: Option<String>,

    /// Lower bound of the random delay, in milliseconds
    #[arg(long, value_name = "MS", allow_hyphen_values = true)]
    delay_min: Option<String>,

    /// Upper bound of the random delay, in milliseconds
    #[arg(long, value_name = "MS", allow_hyphen_values = true)]
    delay_max: Option<String>,

    /// Probability (0-1) of dropping a request's connection
    #[arg(long, value_name = "P", allow_hyphen_values = true)]
    abort_randomly: Option<String>,

    /// Request log layout: size, reading or balanced
    #[arg(long, value_name = "MODE")]
    optimize_for: Option<String>,

    /// Directory to serve (defaults to the current directory)
    #[arg(long, env = "PEEKSERVE_ROOT")]
    root: Option<PathBuf>,

    /// Address to bind to
    #[arg(long, env = "PEEKSERVE_HOST")]
    host: Option<String>,

    /// TOML file with default options; command-line flags take precedence
    #[arg(short, long, env = "PEEKSERVE_CONFIG")]
    config: Option<PathBuf>,

    /// Take client addresses from X-Forwarded-For
    #[arg(long)]
    trust_proxy: bool,

    /// Secret for verifying signed cookies
    #[arg(long, env = "PEEKSERVE_COOKIE_SECRET", hide_env_values = true)]
    cookie_secret: Option<String>,

    /// Leave cookies out of the request log
    #[arg(long)]
    hide_cookies: bool,

    /// Leave signed cookies out of the request log
    #[arg(long)]
    hide_signed_cookies: bool,

    /// Leave the forwarded address chain out of the request log
    #[arg(long)]
    hide_ips: bool,

    /// Only log request URLs, warnings and errors
    #[arg(short, long)]
    quiet: bool,
}

impl Cli {
    fn raw_options(&self) -> RawOptions {
        RawOptions {
            port: self.port.clone().map(Into::into),
            port_dynamic: self.port_dynamic.then_some(true),
            disable_static: self.disable_static.then_some(true),
            status: self.status.clone().map(Into::into),
            response: self.response.clone(),
            delay_min: self.delay_min.clone().map(Into::into),
            delay_max: self.delay_max.clone().map(Into::into),
            abort_randomly: self.abort_randomly.clone().map(Into::into),
            optimize_for: self.optimize_for.clone(),
            root: self.root.clone(),
            host: self.host.clone(),
            trust_proxy: self.trust_proxy.then_some(true),
            cookie_secret: self.cookie_secret.clone(),
            include_cookies: self.hide_cookies.then_some(false),
            include_signed_cookies: self.hide_signed_cookies.then_some(false),
            include_ips: self.hide_ips.then_some(false),
            quiet: self.quiet.then_some(true),
        }
    }
}

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "Error: {err:#}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let options = load_options(&cli);
    let quiet = options
        .as_ref()
        .ok()
        .and_then(|raw| raw.quiet)
        .unwrap_or(false);
    init_tracing(quiet);

    let mut raw = options?;
    let root = raw.root.take().unwrap_or_else(|| PathBuf::from("."));
    raw.root = Some(root.canonicalize().unwrap_or(root));

    let config = PipelineConfig::from_raw(raw);
    async_main(config)
}

#[tokio::main]
async fn async_main(config: PipelineConfig) -> Result<()> {
    server::run(config).await?;
    Ok(())
}

fn load_options(cli: &Cli) -> Result<RawOptions> {
    let file = match &cli.config {
        Some(path) => RawOptions::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RawOptions::default(),
    };
    Ok(file.overlay(cli.raw_options()))
}

fn init_tracing(quiet: bool) {
    let filter = if quiet {
        "peekserve=info"
    } else {
        "peekserve=debug"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use peekserve::config::Loose;

    /// Every variable the CLI reads. Tests run with all of them cleared
    /// unless they set one explicitly.
    const CLI_ENV: [&str; 6] = [
        "PORT",
        "PORT_DYNAMIC",
        "PEEKSERVE_ROOT",
        "PEEKSERVE_HOST",
        "PEEKSERVE_CONFIG",
        "PEEKSERVE_COOKIE_SECRET",
    ];

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn parse_with_env(vars: &[(&str, &str)], args: &[&str]) -> Result<Cli, clap::Error> {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let saved: Vec<_> = CLI_ENV.iter().map(|k| (*k, std::env::var_os(k))).collect();

        // SAFETY: ENV_LOCK serializes every test that touches the environment
        // in this binary, and the previous values are restored below.
        unsafe {
            for key in CLI_ENV {
                std::env::remove_var(key);
            }
            for (key, value) in vars {
                std::env::set_var(key, value);
            }
        }

        let parsed = Cli::try_parse_from(std::iter::once("peekserve").chain(args.iter().copied()));

        // SAFETY: as above
        unsafe {
            for (key, value) in saved {
                match value {
                    Some(value) => std::env::set_var(key, value),
                    None => std::env::remove_var(key),
                }
            }
        }
        parsed
    }

    fn parse(args: &[&str]) -> Cli {
        parse_with_env(&[], args).unwrap()
    }

    #[test]
    fn test_port_dynamic_env_accepts_yes() {
        let cli = parse_with_env(&[("PORT_DYNAMIC", "yes")], &[]).unwrap();
        assert!(cli.port_dynamic);
        assert_eq!(cli.raw_options().port_dynamic, Some(true));
    }

    #[test]
    fn test_port_dynamic_env_boolish_values() {
        for value in ["1", "on", "true", "YES"] {
            let cli = parse_with_env(&[("PORT_DYNAMIC", value)], &[]).unwrap();
            assert!(cli.port_dynamic, "{value}");
        }
        for value in ["0", "off", "no", "false"] {
            let cli = parse_with_env(&[("PORT_DYNAMIC", value)], &[]).unwrap();
            assert!(!cli.port_dynamic, "{value}");
            assert_eq!(cli.raw_options().port_dynamic, None);
        }
    }

    #[test]
    fn test_port_env_feeds_port() {
        let cli = parse_with_env(&[("PORT", "9123")], &[]).unwrap();
        assert_eq!(cli.raw_options().port, Some(Loose::Text("9123".to_string())));

        let cli = parse_with_env(&[("PORT", "9123")], &["--port", "9200"]).unwrap();
        assert_eq!(cli.raw_options().port, Some(Loose::Text("9200".to_string())));
    }

    #[test]
    fn test_hide_flags_disable_fields() {
        let raw = parse(&["--hide-cookies", "--hide-signed-cookies", "--hide-ips"]).raw_options();
        assert_eq!(raw.include_cookies, Some(false));
        assert_eq!(raw.include_signed_cookies, Some(false));
        assert_eq!(raw.include_ips, Some(false));

        let raw = parse(&[]).raw_options();
        assert_eq!(raw.include_cookies, None);
        assert_eq!(raw.include_signed_cookies, None);
        assert_eq!(raw.include_ips, None);
    }

    #[test]
    fn test_unset_flags_leave_options_empty() {
        let raw = parse(&[]).raw_options();
        assert!(raw.port.is_none());
        assert!(raw.port_dynamic.is_none());
        assert!(raw.disable_static.is_none());
        assert!(raw.status.is_none());
        assert!(raw.quiet.is_none());
    }

    #[test]
    fn test_loose_numbers_reach_normalization() {
        let cli = parse(&[
            "--status",
            "-1",
            "--delay-min",
            "-20",
            "--delay-max",
            "50",
            "--abort-randomly",
            "2",
            "--optimize-for",
            "reading",
        ]);
        let config = PipelineConfig::from_raw(cli.raw_options());
        assert_eq!(config.fallback_status, 404);
        assert_eq!(config.delay_min_ms, 0);
        assert_eq!(config.delay_max_ms, 50);
        assert_eq!(config.abort_probability, 1.0);
        assert_eq!(
            config.log_optimization,
            peekserve::OptimizeFor::Reading
        );
    }

    #[test]
    fn test_cli_overrides_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peekserve.toml");
        std::fs::write(
            &path,
            "port = 9001\nstatus = 418\nresponse = \"from file\"\ninclude-ips = true\n",
        )
        .unwrap();
        let path = path.to_string_lossy().to_string();

        let cli = parse(&["--config", &path, "--port", "9100", "--hide-ips"]);
        let config = PipelineConfig::from_raw(load_options(&cli).unwrap());
        assert_eq!(config.port, 9100);
        assert_eq!(config.fallback_status, 418);
        assert_eq!(config.fallback_body.as_deref(), Some("from file"));
        assert!(!config.include_ips);
    }

    #[test]
    fn test_missing_config_file_is_an_error() {
        let cli = parse(&["--config", "/definitely/not/here.toml"]);
        assert!(load_options(&cli).is_err());
    }
}
