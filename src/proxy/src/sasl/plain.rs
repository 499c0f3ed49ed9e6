use crate::sasl::{MechanismDriver, SaslError, SaslSettings};

/// PLAIN (RFC 4616): a single response carrying
/// `authzid NUL authid NUL password`. The server never sends a challenge.
pub(crate) struct PlainMechanism {
    set: SaslSettings,
    output_sent: bool,
}

impl PlainMechanism {
    pub(crate) fn new(set: SaslSettings) -> Self {
        Self {
            set,
            output_sent: false,
        }
    }
}

impl MechanismDriver for PlainMechanism {
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
        let authid = self
            .set
            .authid
            .as_deref()
            .ok_or_else(|| SaslError::Internal("authid not set".to_string()))?;
        let password = self
            .set
            .password
            .as_deref()
            .ok_or_else(|| SaslError::Internal("password not set".to_string()))?;

        let mut out = Vec::with_capacity(64);
        if let Some(authzid) = self.set.authzid.as_deref() {
            out.extend_from_slice(authzid.as_bytes());
        }
        out.push(0);
        out.extend_from_slice(authid.as_bytes());
        out.push(0);
        out.extend_from_slice(password.as_bytes());

        self.output_sent = true;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver(authzid: Option<&str>) -> PlainMechanism {
        PlainMechanism::new(SaslSettings {
            authid: Some("alice".to_string()),
            authzid: authzid.map(str::to_string),
            password: Some("secret".to_string()),
        })
    }

    #[test]
    fn output_is_nul_joined_triple() {
        let mut mech = driver(None);
        assert_eq!(mech.output().unwrap(), b"\0alice\0secret");

        let mut mech = driver(Some("master"));
        assert_eq!(mech.output().unwrap(), b"master\0alice\0secret");
    }

    #[test]
    fn empty_initial_challenge_is_accepted() {
        let mut mech = driver(None);
        assert!(mech.input(b"").is_ok());
        assert!(mech.output().is_ok());
    }

    #[test]
    fn non_empty_initial_challenge_is_protocol_error() {
        let mut mech = driver(None);
        let err = mech.input(b"surprise").unwrap_err();
        assert!(matches!(err, SaslError::Protocol(_)));
    }

    #[test]
    fn input_after_output_is_protocol_error() {
        let mut mech = driver(None);
        mech.output().unwrap();
        let err = mech.input(b"").unwrap_err();
        assert_eq!(
            err,
            SaslError::Protocol("Server didn't finish authentication".to_string())
        );
    }
}
