use crate::sasl::{MechanismDriver, SaslError, SaslSettings};

/// EXTERNAL (RFC 4422 appendix A): authentication is established out of band
/// (usually a TLS client certificate); the single response only names who to
/// authorize as.
pub(crate) struct ExternalMechanism {
    set: SaslSettings,
    output_sent: bool,
}

impl ExternalMechanism {
    pub(crate) fn new(set: SaslSettings) -> Self {
        Self {
            set,
            output_sent: false,
        }
    }
}

impl MechanismDriver for ExternalMechanism {
    fn input(&mut self, input: &[u8]) -> Result<(), SaslError> {
        if !self.output_sent {
            if !input.is_empty() {
                return Err(SaslError::Protocol(
                    "Server sent non-empty initial response".to_string(),
                ));
            }
            Ok(())
        } else {
            Err(SaslError::Protocol(
                "Server didn't finish authentication".to_string(),
            ))
        }
    }

    fn output(&mut self) -> Result<Vec<u8>, SaslError> {
        let username = self
            .set
            .authzid
            .as_deref()
            .or(self.set.authid.as_deref())
            .unwrap_or("");
        self.output_sent = true;
        Ok(username.as_bytes().to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_prefers_authzid_over_authid() {
        let mut mech = ExternalMechanism::new(SaslSettings {
            authid: Some("cert-cn".to_string()),
            authzid: Some("alice".to_string()),
            password: None,
        });
        assert_eq!(mech.output().unwrap(), b"alice");

        let mut mech = ExternalMechanism::new(SaslSettings {
            authid: Some("cert-cn".to_string()),
            ..Default::default()
        });
        assert_eq!(mech.output().unwrap(), b"cert-cn");

        let mut mech = ExternalMechanism::new(SaslSettings::default());
        assert_eq!(mech.output().unwrap(), b"");
    }

    #[test]
    fn input_after_output_is_protocol_error() {
        let mut mech = ExternalMechanism::new(SaslSettings::default());
        assert!(mech.input(b"").is_ok());
        mech.output().unwrap();
        assert!(matches!(mech.input(b""), Err(SaslError::Protocol(_))));
    }
}
