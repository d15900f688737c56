//! Checks run before any relay leaves the gateway.

use super::{
    RelayRequest,
    payload::RequestPayload,
};
use crate::{
    error::{
        AuthorizationFailure,
        GatewayError,
        Result,
    },
    models::{
        Blockchain,
        GatewaySettings,
    },
    secret::{
        SecretKeyCipher,
        secret_matches,
    },
};

/// Secret key, origin and user agent checks.
pub fn check_caller(
    settings: &GatewaySettings,
    request: &RelayRequest,
    cipher: Option<&SecretKeyCipher>,
) -> Result<()> {
    if settings.secret_key_required {
        let matches = match (settings.secret_key.as_deref(), request.secret_key.as_deref()) {
            (Some(stored), Some(provided)) => secret_matches(stored, provided, cipher),
            _ => false,
        };
        if !matches {
            return Err(GatewayError::Authorization(AuthorizationFailure::SecretKey));
        }
    }

    if !settings.whitelist_origins.is_empty() {
        let allowed = request.origin.as_deref().is_some_and(|origin| {
            settings
                .whitelist_origins
                .iter()
                .any(|allowed| allowed == origin)
        });
        if !allowed {
            return Err(GatewayError::Authorization(AuthorizationFailure::Origin));
        }
    }

    if !settings.whitelist_user_agents.is_empty() {
        let allowed = request.user_agent.as_deref().is_some_and(|agent| {
            let agent = agent.to_ascii_lowercase();
            settings
                .whitelist_user_agents
                .iter()
                .any(|allowed| agent.contains(&allowed.to_ascii_lowercase()))
        });
        if !allowed {
            return Err(GatewayError::Authorization(AuthorizationFailure::UserAgent));
        }
    }

    Ok(())
}

/// Blockchain and method whitelists plus the `eth_getLogs` range ceiling.
pub fn check_call(
    settings: &GatewaySettings,
    blockchain: &Blockchain,
    payload: &RequestPayload,
) -> Result<()> {
    if !settings.whitelist_blockchains.is_empty()
        && !settings.whitelist_blockchains.contains(&blockchain.id)
    {
        return Err(GatewayError::Authorization(AuthorizationFailure::Blockchain));
    }

    if !settings.whitelist_methods.is_empty() {
        let methods = payload.methods();
        let allowed = !methods.is_empty()
            && methods.iter().all(|method| {
                settings
                    .whitelist_methods
                    .iter()
                    .any(|allowed| allowed == method)
            });
        if !allowed {
            return Err(GatewayError::Authorization(AuthorizationFailure::Method));
        }
    }

    if let Some(limit) = blockchain.log_limit_blocks {
        if payload.log_range_exceeding(limit).is_some() {
            return Err(GatewayError::Configuration(format!(
                "eth_getLogs is limited to {limit} blocks"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{
        blockchain,
        relay_request,
    };

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    fn settings() -> GatewaySettings {
        GatewaySettings::default()
    }

    #[test]
    fn open_settings_allow_everything() {
        assert!(check_caller(&settings(), &relay_request(), None).is_ok());
        let payload = RequestPayload::parse(&relay_request().data);
        assert!(check_call(&settings(), &blockchain(), &payload).is_ok());
    }

    #[test]
    fn required_secret_must_match() {
        let settings = GatewaySettings {
            secret_key: Some(SECRET.into()),
            secret_key_required: true,
            ..settings()
        };
        let mut request = relay_request();
        assert!(matches!(
            check_caller(&settings, &request, None),
            Err(GatewayError::Authorization(AuthorizationFailure::SecretKey))
        ));

        request.secret_key = Some(SECRET.into());
        assert!(check_caller(&settings, &request, None).is_ok());
    }

    #[test]
    fn origins_match_exactly_and_agents_by_substring() {
        let settings = GatewaySettings {
            whitelist_origins: vec!["https://app.example".into()],
            whitelist_user_agents: vec!["metamask".into()],
            ..settings()
        };
        let mut request = relay_request();
        request.origin = Some("https://app.example.evil".into());
        assert!(matches!(
            check_caller(&settings, &request, None),
            Err(GatewayError::Authorization(AuthorizationFailure::Origin))
        ));

        request.origin = Some("https://app.example".into());
        request.user_agent = Some("curl/8.0".into());
        assert!(matches!(
            check_caller(&settings, &request, None),
            Err(GatewayError::Authorization(AuthorizationFailure::UserAgent))
        ));

        request.user_agent = Some("Mozilla/5.0 MetaMask/10.0".into());
        assert!(check_caller(&settings, &request, None).is_ok());
    }

    #[test]
    fn whitelists_cover_chains_and_every_batched_method() {
        let settings = GatewaySettings {
            whitelist_blockchains: vec!["0021".into()],
            whitelist_methods: vec!["eth_chainId".into()],
            ..settings()
        };
        let single = RequestPayload::parse(r#"{"id":1,"method":"eth_chainId"}"#);
        assert!(check_call(&settings, &blockchain(), &single).is_ok());

        let batch = RequestPayload::parse(concat!(
            r#"[{"id":1,"method":"eth_chainId"},"#,
            r#"{"id":2,"method":"eth_call"}]"#,
        ));
        assert!(matches!(
            check_call(&settings, &blockchain(), &batch),
            Err(GatewayError::Authorization(AuthorizationFailure::Method))
        ));

        let other_chain = Blockchain {
            id: "0040".into(),
            ..blockchain()
        };
        assert!(matches!(
            check_call(&settings, &other_chain, &single),
            Err(GatewayError::Authorization(AuthorizationFailure::Blockchain))
        ));
    }

    #[test]
    fn oversized_log_ranges_are_bad_requests() {
        let limited = Blockchain {
            log_limit_blocks: Some(100),
            ..blockchain()
        };
        let payload = RequestPayload::parse(
            r#"{"method":"eth_getLogs","params":[{"fromBlock":"0x0","toBlock":"0x100"}]}"#,
        );
        assert!(matches!(
            check_call(&settings(), &limited, &payload),
            Err(GatewayError::Configuration(_))
        ));
    }
}
