//! Map parsed CLI arguments to the action the binary runs.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{gateway, sso};
use anyhow::Result;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>("dsn")
        .map(|dsn| dsn.trim().to_string())
        .filter(|dsn| !dsn.is_empty());

    let gateway_opts = gateway::Options::parse(matches)?;
    let sso_opts = sso::Options::parse(matches, gateway_opts.enable_sso)?;

    Ok(Action::Server(Args {
        port,
        dsn,
        base_url: gateway_opts.base_url,
        enable_sso: gateway_opts.enable_sso,
        enable_local_logins: gateway_opts.enable_local_logins,
        must_approve_users: gateway_opts.must_approve_users,
        session_ttl_seconds: gateway_opts.session_ttl_seconds,
        max_password_length: gateway_opts.max_password_length,
        sso_url: sso_opts.url,
        sso_secret: sso_opts.secret,
        sso_nonce_ttl_seconds: sso_opts.nonce_ttl_seconds,
        trust_proxy_headers: gateway_opts.trust_proxy_headers,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    const SSO_VARS: [(&str, Option<&str>); 5] = [
        ("PORTICO_ENABLE_SSO", None),
        ("PORTICO_SSO_URL", None),
        ("PORTICO_SSO_SECRET", None),
        ("PORTICO_DSN", None),
        ("PORTICO_TRUST_PROXY_HEADERS", None),
    ];

    #[test]
    fn sso_requires_url_and_secret() {
        temp_env::with_vars(SSO_VARS, || {
            let matches = crate::cli::commands::new().get_matches_from(vec![
                "portico",
                "--enable-sso",
                "true",
                "--sso-url",
                "https://idp.example.com/sso",
            ]);
            let result = handler(&matches);
            assert!(
                result
                    .err()
                    .is_some_and(|err| err.to_string().contains("--sso-secret"))
            );
        });
    }

    #[test]
    fn sso_arguments_reach_the_action() {
        temp_env::with_vars(SSO_VARS, || {
            let matches = crate::cli::commands::new().get_matches_from(vec![
                "portico",
                "--enable-sso",
                "true",
                "--sso-url",
                "https://idp.example.com/sso",
                "--sso-secret",
                "s3cret",
                "--base-url",
                "https://forum.example.com",
            ]);
            match handler(&matches) {
                Ok(Action::Server(args)) => {
                    assert!(args.enable_sso);
                    assert_eq!(args.base_url, "https://forum.example.com");
                    assert_eq!(args.sso_url.as_deref(), Some("https://idp.example.com/sso"));
                    assert_eq!(
                        args.sso_secret.as_ref().map(|s| s.expose_secret().to_string()),
                        Some("s3cret".to_string())
                    );
                    assert_eq!(args.dsn, None);
                }
                Err(err) => panic!("unexpected error: {err}"),
            }
        });
    }

    #[test]
    fn blank_dsn_means_in_memory() {
        temp_env::with_vars(SSO_VARS, || {
            let matches =
                crate::cli::commands::new().get_matches_from(vec!["portico", "--dsn", "  "]);
            match handler(&matches) {
                Ok(Action::Server(args)) => assert_eq!(args.dsn, None),
                Err(err) => panic!("unexpected error: {err}"),
            }
        });
    }

    #[test]
    fn proxy_headers_are_untrusted_unless_enabled() {
        temp_env::with_vars(SSO_VARS, || {
            let matches = crate::cli::commands::new().get_matches_from(vec!["portico"]);
            match handler(&matches) {
                Ok(Action::Server(args)) => assert!(!args.trust_proxy_headers),
                Err(err) => panic!("unexpected error: {err}"),
            }

            let matches = crate::cli::commands::new().get_matches_from(vec![
                "portico",
                "--trust-proxy-headers",
                "true",
            ]);
            match handler(&matches) {
                Ok(Action::Server(args)) => assert!(args.trust_proxy_headers),
                Err(err) => panic!("unexpected error: {err}"),
            }
        });
    }
}
