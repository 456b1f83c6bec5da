use clap::{Arg, ArgMatches, Command};

pub const ARG_BASE_URL: &str = "base-url";
pub const ARG_ENABLE_SSO: &str = "enable-sso";
pub const ARG_ENABLE_LOCAL_LOGINS: &str = "enable-local-logins";
pub const ARG_MUST_APPROVE_USERS: &str = "must-approve-users";
pub const ARG_SESSION_TTL_SECONDS: &str = "session-ttl-seconds";
pub const ARG_MAX_PASSWORD_LENGTH: &str = "max-password-length";
pub const ARG_TRUST_PROXY_HEADERS: &str = "trust-proxy-headers";

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_BASE_URL)
                .long(ARG_BASE_URL)
                .help("Public base URL of the gateway, used for the SSO return URL and cookie flags")
                .env("PORTICO_BASE_URL")
                .default_value("http://localhost:8080"),
        )
        .arg(
            Arg::new(ARG_ENABLE_SSO)
                .long(ARG_ENABLE_SSO)
                .help("Delegate logins to the SSO provider; disables local logins")
                .env("PORTICO_ENABLE_SSO")
                .default_value("false")
                .value_parser(clap::value_parser!(bool)),
        )
        .arg(
            Arg::new(ARG_ENABLE_LOCAL_LOGINS)
                .long(ARG_ENABLE_LOCAL_LOGINS)
                .help("Allow username/password logins")
                .env("PORTICO_ENABLE_LOCAL_LOGINS")
                .default_value("true")
                .value_parser(clap::value_parser!(bool)),
        )
        .arg(
            Arg::new(ARG_MUST_APPROVE_USERS)
                .long(ARG_MUST_APPROVE_USERS)
                .help("Require staff approval before a new account can log in")
                .env("PORTICO_MUST_APPROVE_USERS")
                .default_value("false")
                .value_parser(clap::value_parser!(bool)),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL_SECONDS)
                .long(ARG_SESSION_TTL_SECONDS)
                .help("Idle lifetime of a session in seconds")
                .env("PORTICO_SESSION_TTL_SECONDS")
                .default_value("7200")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_MAX_PASSWORD_LENGTH)
                .long(ARG_MAX_PASSWORD_LENGTH)
                .help("Passwords longer than this are rejected without hashing")
                .env("PORTICO_MAX_PASSWORD_LENGTH")
                .default_value("200")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(
            Arg::new(ARG_TRUST_PROXY_HEADERS)
                .long(ARG_TRUST_PROXY_HEADERS)
                .help("Rate-limit by X-Forwarded-For/X-Real-IP instead of the peer address; only behind a proxy that sets them")
                .env("PORTICO_TRUST_PROXY_HEADERS")
                .default_value("false")
                .value_parser(clap::value_parser!(bool)),
        )
}

#[derive(Debug)]
pub struct Options {
    pub base_url: String,
    pub enable_sso: bool,
    pub enable_local_logins: bool,
    pub must_approve_users: bool,
    pub session_ttl_seconds: i64,
    pub max_password_length: usize,
    pub trust_proxy_headers: bool,
}

impl Options {
    /// Read gateway options from parsed matches.
    ///
    /// # Errors
    /// Returns an error if the base URL is missing.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let base_url = matches
            .get_one::<String>(ARG_BASE_URL)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("missing required argument: --{ARG_BASE_URL}"))?;
        let flag = |name: &str| matches.get_one::<bool>(name).copied().unwrap_or(false);

        Ok(Self {
            base_url,
            enable_sso: flag(ARG_ENABLE_SSO),
            enable_local_logins: matches
                .get_one::<bool>(ARG_ENABLE_LOCAL_LOGINS)
                .copied()
                .unwrap_or(true),
            must_approve_users: flag(ARG_MUST_APPROVE_USERS),
            session_ttl_seconds: matches
                .get_one::<i64>(ARG_SESSION_TTL_SECONDS)
                .copied()
                .unwrap_or(7200),
            max_password_length: matches
                .get_one::<usize>(ARG_MAX_PASSWORD_LENGTH)
                .copied()
                .unwrap_or(200),
            trust_proxy_headers: flag(ARG_TRUST_PROXY_HEADERS),
        })
    }
}
