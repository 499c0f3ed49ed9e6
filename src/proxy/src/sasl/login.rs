use crate::sasl::{MechanismDriver, SaslError, SaslSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoginState {
    Init,
    User,
    Pass,
}

/// LOGIN: the obsolete two-step username/password exchange still spoken by
/// plenty of deployed servers. Each server challenge advances the state; the
/// challenge text itself ("Username:", "Password:") is ignored.
pub(crate) struct LoginMechanism {
    set: SaslSettings,
    state: LoginState,
}

impl LoginMechanism {
    pub(crate) fn new(set: SaslSettings) -> Self {
        Self {
            set,
            state: LoginState::Init,
        }
    }
}

impl MechanismDriver for LoginMechanism {
    fn input(&mut self, _input: &[u8]) -> Result<(), SaslError> {
        self.state = match self.state {
            LoginState::Init => LoginState::User,
            LoginState::User => LoginState::Pass,
            LoginState::Pass => {
                return Err(SaslError::Protocol(
                    "Server didn't finish authentication".to_string(),
                ))
            }
        };
        Ok(())
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

        Ok(match self.state {
            LoginState::Init => Vec::new(),
            LoginState::User => authid.as_bytes().to_vec(),
            LoginState::Pass => password.as_bytes().to_vec(),
        })
    }
}
