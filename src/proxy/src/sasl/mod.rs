use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

pub mod external;
pub mod login;
pub mod plain;

use crate::sasl::external::ExternalMechanism;
use crate::sasl::login::LoginMechanism;
use crate::sasl::plain::PlainMechanism;

/// SASL mechanisms the proxy can drive against a backend. Parsed from the
/// per-login `proxy_mech` field, case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, AsRefStr, Display)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
pub enum Mechanism {
    Plain,
    Login,
    External,
}

impl Mechanism {
    pub fn uses_password(&self) -> bool {
        !matches!(self, Mechanism::External)
    }
}

/// Credentials handed to [`SaslClient::new`].
#[derive(Debug, Default, Clone)]
pub struct SaslSettings {
    /// Authentication id, required by most mechanisms.
    pub authid: Option<String>,
    /// Authorization id (who to log in as, when authid is a master user).
    pub authzid: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SaslError {
    /// The final server response reported failed authentication.
    #[error("{0}")]
    AuthFailed(String),
    /// The server sent input that violates the mechanism's exchange rules.
    #[error("{0}")]
    Protocol(String),
    /// The client side is misconfigured or broken.
    #[error("{0}")]
    Internal(String),
}

/// Lazily fetches channel-binding data of the given type ("tls-unique",
/// "tls-exporter", ...) from the TLS layer owning the connection.
pub type ChannelBindingCallback =
    Box<dyn Fn(&str) -> Result<Vec<u8>, String> + Send + Sync>;

pub(crate) trait MechanismDriver: Send {
    /// Feed one server challenge.
    fn input(&mut self, input: &[u8]) -> Result<(), SaslError>;

    /// Produce the next client response. Also produces the initial response
    /// when the application protocol carries one.
    fn output(&mut self) -> Result<Vec<u8>, SaslError>;

    /// Mechanism-specific tunable. Returns false when the parameter is not
    /// recognized by this mechanism.
    fn set_parameter(&mut self, _param: &str, _value: Option<&str>) -> Result<bool, SaslError> {
        Ok(false)
    }

    /// Mechanism-specific result value, readable after the exchange.
    fn get_result(&self, _key: &str) -> Option<String> {
        None
    }
}

/// Mechanism-polymorphic client side of a SASL exchange. One instance lives
/// for the duration of a single authentication attempt.
pub struct SaslClient {
    mech: Mechanism,
    driver: Box<dyn MechanismDriver>,
    channel_binding: Option<ChannelBindingCallback>,
}

impl std::fmt::Debug for SaslClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaslClient")
            .field("mech", &self.mech)
            .field("channel_binding", &self.channel_binding.is_some())
            .finish()
    }
}

impl SaslClient {
    pub fn new(mech: Mechanism, set: SaslSettings) -> Result<Self, SaslError> {
        if mech != Mechanism::External {
            if set.authid.is_none() {
                return Err(SaslError::Internal("authid not set".to_string()));
            }
            if set.password.is_none() {
                return Err(SaslError::Internal("password not set".to_string()));
            }
        }
        let driver: Box<dyn MechanismDriver> = match mech {
            Mechanism::Plain => Box::new(PlainMechanism::new(set)),
            Mechanism::Login => Box::new(LoginMechanism::new(set)),
            Mechanism::External => Box::new(ExternalMechanism::new(set)),
        };
        Ok(Self {
            mech,
            driver,
            channel_binding: None,
        })
    }

    pub fn mechanism(&self) -> Mechanism {
        self.mech
    }

    /// Enable channel-binding support. The callback is only consulted by
    /// mechanisms that bind to the TLS channel; the mechanisms shipped here
    /// ignore it.
    pub fn enable_channel_binding(&mut self, callback: ChannelBindingCallback) {
        self.channel_binding = Some(callback);
    }

    /// Fetch channel-binding data of the given type from the TLS layer.
    /// `None` when channel binding was never enabled.
    pub fn channel_binding(&self, kind: &str) -> Option<Result<Vec<u8>, String>> {
        self.channel_binding.as_ref().map(|callback| callback(kind))
    }

    pub fn input(&mut self, input: &[u8]) -> Result<(), SaslError> {
        self.driver.input(input)
    }

    pub fn output(&mut self) -> Result<Vec<u8>, SaslError> {
        self.driver.output()
    }

    pub fn set_parameter(&mut self, param: &str, value: Option<&str>) -> Result<bool, SaslError> {
        self.driver.set_parameter(param, value)
    }

    pub fn get_result(&self, key: &str) -> Option<String> {
        self.driver.get_result(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_settings() -> SaslSettings {
        SaslSettings {
            authid: Some("alice".to_string()),
            authzid: None,
            password: Some("secret".to_string()),
        }
    }

    #[test]
    fn mechanism_names_parse_case_insensitively() {
        assert_eq!("plain".parse::<Mechanism>().unwrap(), Mechanism::Plain);
        assert_eq!("LOGIN".parse::<Mechanism>().unwrap(), Mechanism::Login);
        assert_eq!("ExTeRnAl".parse::<Mechanism>().unwrap(), Mechanism::External);
        assert!("SCRAM-SHA-1".parse::<Mechanism>().is_err());
        assert_eq!(Mechanism::Plain.to_string(), "PLAIN");
    }

    #[test]
    fn plain_requires_authid_and_password() {
        let err = SaslClient::new(Mechanism::Plain, SaslSettings::default()).unwrap_err();
        assert!(matches!(err, SaslError::Internal(_)));

        let err = SaslClient::new(
            Mechanism::Login,
            SaslSettings {
                authid: Some("alice".to_string()),
                ..Default::default()
            },
        )
        .unwrap_err();
        assert_eq!(err, SaslError::Internal("password not set".to_string()));
    }

    #[test]
    fn external_requires_nothing() {
        let client = SaslClient::new(Mechanism::External, SaslSettings::default());
        assert!(client.is_ok());
    }

    #[test]
    fn unknown_parameter_is_reported_as_not_found() {
        let mut client = SaslClient::new(Mechanism::Plain, full_settings()).unwrap();
        assert!(!client.set_parameter("nonstd_maxbuf", Some("65536")).unwrap());
        assert_eq!(client.get_result("session_token"), None);
    }

    #[test]
    fn channel_binding_callback_is_fetched_lazily() {
        let mut client = SaslClient::new(Mechanism::External, SaslSettings::default()).unwrap();
        assert!(client.channel_binding("tls-unique").is_none());

        client.enable_channel_binding(Box::new(|kind| {
            assert_eq!(kind, "tls-unique");
            Ok(b"binding-data".to_vec())
        }));
        assert_eq!(
            client.channel_binding("tls-unique"),
            Some(Ok(b"binding-data".to_vec()))
        );
    }
}
