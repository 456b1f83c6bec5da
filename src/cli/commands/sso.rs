use anyhow::{Result, anyhow};
use clap::{Arg, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_SSO_URL: &str = "sso-url";
pub const ARG_SSO_SECRET: &str = "sso-secret";
pub const ARG_SSO_NONCE_TTL_SECONDS: &str = "sso-nonce-ttl-seconds";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SSO_URL)
                .long(ARG_SSO_URL)
                .help("Identity provider endpoint that receives the signed login request")
                .env("PORTICO_SSO_URL"),
        )
        .arg(
            Arg::new(ARG_SSO_SECRET)
                .long(ARG_SSO_SECRET)
                .help("Shared HMAC secret for SSO payloads")
                .env("PORTICO_SSO_SECRET")
                .hide_env_values(true),
        )
        .arg(
            Arg::new(ARG_SSO_NONCE_TTL_SECONDS)
                .long(ARG_SSO_NONCE_TTL_SECONDS)
                .help("How long an issued SSO nonce stays valid")
                .env("PORTICO_SSO_NONCE_TTL_SECONDS")
                .default_value("600")
                .value_parser(clap::value_parser!(u64)),
        )
}

#[derive(Debug)]
pub struct Options {
    pub url: Option<String>,
    pub secret: Option<SecretString>,
    pub nonce_ttl_seconds: u64,
}

impl Options {
    /// Read SSO options; `enabled` makes the provider URL and secret mandatory.
    ///
    /// # Errors
    /// Returns an error if SSO is enabled without a provider URL or secret.
    pub fn parse(matches: &ArgMatches, enabled: bool) -> Result<Self> {
        let non_empty = |name: &str| {
            matches
                .get_one::<String>(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let url = non_empty(ARG_SSO_URL);
        let secret = non_empty(ARG_SSO_SECRET).map(SecretString::from);

        if enabled {
            if url.is_none() {
                return Err(anyhow!(
                    "missing required argument: --{ARG_SSO_URL} (required with --enable-sso)"
                ));
            }
            if secret.is_none() {
                return Err(anyhow!(
                    "missing required argument: --{ARG_SSO_SECRET} (required with --enable-sso)"
                ));
            }
        }

        Ok(Self {
            url,
            secret,
            nonce_ttl_seconds: matches
                .get_one::<u64>(ARG_SSO_NONCE_TTL_SECONDS)
                .copied()
                .unwrap_or(600),
        })
    }
}
