use crate::protocol::referral::parse_referral;
use crate::protocol::{DriverAction, ProtocolDriver};
use crate::sasl::{SaslClient, SaslError, SaslSettings};
use crate::server::client::ClientSession;
use crate::server::{
    FailureType, ProxyFailure, SslFlags, AUTH_FAILED_MSG, LOGIN_PROXY_FAILURE_MSG,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use common::strescape::{sanitize, tabescape};
use itertools::Itertools;
use std::sync::Arc;
use strum_macros::IntoStaticStr;
use tracing::debug;

const CLIENT_TRANSPORT_TLS: &str = "TLS";
const CLIENT_TRANSPORT_INSECURE: &str = "insecure";

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[strum(serialize_all = "lowercase")]
enum Pop3ProxyState {
    Banner,
    StartTls,
    XClient,
    Login1,
    Login2,
}

/// POP3 front-end of the login phase: consumes backend reply lines and tells
/// the proxy connection what to send where, until the backend accepts the
/// login and the connection detaches into plain relaying.
pub struct Pop3Driver {
    client: Arc<ClientSession>,
    ssl_flags: SslFlags,
    state: Pop3ProxyState,
    xclient_available: bool,
    sasl: Option<SaslClient>,
}

impl Pop3Driver {
    pub fn new(client: Arc<ClientSession>, ssl_flags: SslFlags) -> Self {
        Self {
            client,
            ssl_flags,
            state: Pop3ProxyState::Banner,
            xclient_available: false,
            sasl: None,
        }
    }

    fn fail(kind: FailureType, reason: impl Into<String>) -> Vec<DriverAction> {
        vec![DriverAction::Fail(ProxyFailure::new(kind, reason))]
    }

    /// Emit XCLIENT when the backend advertised it and we're trusted, then
    /// either the USER command or the SASL AUTH initiation.
    fn send_login(&mut self) -> Vec<DriverAction> {
        let mut actions = Vec::new();

        if self.xclient_available && !self.client.proxy_not_trusted {
            let mut line = format!(
                "XCLIENT ADDR={} PORT={} SESSION={} TTL={} CLIENT-TRANSPORT={}",
                self.client.ip,
                self.client.remote_port,
                self.client.session_id,
                self.client.proxy_ttl() - 1,
                if self.client.end_client_tls_secured {
                    CLIENT_TRANSPORT_TLS
                } else {
                    CLIENT_TRANSPORT_INSECURE
                }
            );
            if let Some(local_name) = self.client.local_name.as_deref() {
                line.push_str(" DESTNAME=");
                line.push_str(local_name);
            }
            let fwd = self
                .client
                .forward_fields()
                .iter()
                .map(|value| tabescape(value))
                .join("\t");
            if !fwd.is_empty() {
                line.push_str(" FORWARD=");
                line.push_str(&BASE64.encode(fwd.as_bytes()));
            }
            line.push_str("\r\n");
            actions.push(DriverAction::SendServer(line.into_bytes()));
            self.state = Pop3ProxyState::XClient;
        } else {
            self.state = Pop3ProxyState::Login1;
        }

        let Some(mech) = self.client.proxy_mech else {
            let user_line = format!("USER {}\r\n", self.client.proxy_user);
            actions.push(DriverAction::SendServer(user_line.into_bytes()));
            return actions;
        };

        let sasl_set = SaslSettings {
            authid: Some(
                self.client
                    .proxy_master_user
                    .clone()
                    .unwrap_or_else(|| self.client.proxy_user.clone()),
            ),
            authzid: self
                .client
                .proxy_master_user
                .as_ref()
                .map(|_| self.client.proxy_user.clone()),
            password: self.client.proxy_password.clone(),
        };
        let mut sasl = match SaslClient::new(mech, sasl_set) {
            Ok(sasl) => sasl,
            Err(err) => {
                return Self::fail(
                    FailureType::Internal,
                    format!("SASL mechanism {mech} init failed: {err}"),
                )
            }
        };
        let initial = match sasl.output() {
            Ok(initial) => initial,
            Err(err) => {
                return Self::fail(
                    FailureType::Internal,
                    format!("SASL mechanism {mech} init failed: {err}"),
                )
            }
        };

        let mut line = format!("AUTH {mech} ");
        if initial.is_empty() {
            line.push('=');
        } else {
            line.push_str(&BASE64.encode(&initial));
        }
        line.push_str("\r\n");
        actions.push(DriverAction::SendServer(line.into_bytes()));
        self.sasl = Some(sasl);
        if self.state != Pop3ProxyState::XClient {
            self.state = Pop3ProxyState::Login2;
        }
        actions
    }

    /// One `+ <base64>` SASL continuation round.
    fn continue_sasl_auth(&mut self, value: &str) -> Vec<DriverAction> {
        let challenge = match BASE64.decode(value.as_bytes()) {
            Ok(challenge) => challenge,
            Err(_) => {
                return Self::fail(
                    FailureType::Protocol,
                    "Invalid base64 data in AUTH response",
                )
            }
        };
        let sasl = self.sasl.as_mut().unwrap_or_else(|| unreachable!());
        let response = sasl.input(&challenge).and_then(|_| sasl.output());
        match response {
            Ok(response) => {
                let mut line = BASE64.encode(&response);
                line.push_str("\r\n");
                vec![DriverAction::SendServer(line.into_bytes())]
            }
            Err(SaslError::AuthFailed(err)) => Self::fail(FailureType::AuthNotReplied, err),
            Err(SaslError::Protocol(err)) => Self::fail(
                FailureType::Protocol,
                format!("Invalid authentication data: {err}"),
            ),
            Err(SaslError::Internal(err)) => Self::fail(FailureType::Internal, err),
        }
    }

    /// The backend rejected the login. Decide what the client gets to see
    /// and how the failure is classified.
    ///
    /// A foreign backend's error text may differ from ours, which leaks
    /// which users exist; the error is forwarded anyway, replacing it would
    /// need a setting nobody configures.
    fn login_failed(&mut self, line: &str) -> Vec<DriverAction> {
        let mut actions = Vec::new();
        let kind;
        let reason;
        if let Some(resp) = line.strip_prefix("-ERR ") {
            if resp.starts_with("[SYS/TEMP]") {
                // surface to the client only once the reconnect decision is
                // made
                kind = FailureType::AuthTempfail;
                reason = resp.to_string();
            } else if let Some(target) = parse_referral(resp) {
                debug!(target = %target, "login referral");
                return vec![DriverAction::Redirect(target)];
            } else {
                actions.push(DriverAction::SendClient(
                    format!("{line}\r\n").into_bytes(),
                ));
                kind = FailureType::AuthReplied;
                reason = resp.to_string();
            }
        } else {
            actions.push(DriverAction::SendClient(
                format!("-ERR {AUTH_FAILED_MSG}\r\n").into_bytes(),
            ));
            kind = FailureType::AuthReplied;
            reason = line.to_string();
        }
        actions.push(DriverAction::Fail(ProxyFailure::new(kind, reason)));
        actions
    }
}

impl ProtocolDriver for Pop3Driver {
    fn handle_line(&mut self, line: &str) -> Vec<DriverAction> {
        match self.state {
            Pop3ProxyState::Banner => {
                let Some(rest) = line.strip_prefix("+OK") else {
                    return Self::fail(
                        FailureType::Protocol,
                        format!("Invalid banner: {}", sanitize(line, 160)),
                    );
                };
                self.xclient_available = rest.starts_with(" [XCLIENT]");
                if self.ssl_flags.contains(SslFlags::STARTTLS) {
                    self.state = Pop3ProxyState::StartTls;
                    vec![DriverAction::SendServer(b"STLS\r\n".to_vec())]
                } else {
                    self.send_login()
                }
            }
            Pop3ProxyState::StartTls => {
                if !line.starts_with("+OK") {
                    return Self::fail(
                        FailureType::Remote,
                        format!("STLS failed: {}", sanitize(line, 160)),
                    );
                }
                let mut actions = vec![DriverAction::StartTls];
                actions.append(&mut self.send_login());
                actions
            }
            Pop3ProxyState::XClient => {
                if !line.starts_with("+OK") {
                    return Self::fail(
                        FailureType::Remote,
                        format!("XCLIENT failed: {}", sanitize(line, 160)),
                    );
                }
                self.state = if self.sasl.is_some() {
                    Pop3ProxyState::Login2
                } else {
                    Pop3ProxyState::Login1
                };
                Vec::new()
            }
            Pop3ProxyState::Login1 => {
                if !line.starts_with("+OK") {
                    return self.login_failed(line);
                }
                // USER accepted, send PASS
                let pass_line = format!(
                    "PASS {}\r\n",
                    self.client.proxy_password.as_deref().unwrap_or("")
                );
                self.state = Pop3ProxyState::Login2;
                vec![DriverAction::SendServer(pass_line.into_bytes())]
            }
            Pop3ProxyState::Login2 => {
                if let Some(value) = line.strip_prefix("+ ") {
                    if self.sasl.is_some() {
                        return self.continue_sasl_auth(value);
                    }
                }
                if !line.starts_with("+OK") {
                    return self.login_failed(line);
                }
                // Login successful; the backend's reply line goes to the
                // client and the connection switches to verbatim relaying.
                vec![
                    DriverAction::SendClient(format!("{line}\r\n").into_bytes()),
                    DriverAction::Detach,
                ]
            }
        }
    }

    fn reset(&mut self) {
        self.state = Pop3ProxyState::Banner;
        self.xclient_available = false;
        self.sasl = None;
    }

    fn state_name(&self) -> &'static str {
        self.state.into()
    }

    fn failure_reply(&self, kind: FailureType, reason: &str) -> Option<Vec<u8>> {
        match kind {
            FailureType::Connect
            | FailureType::Internal
            | FailureType::Remote
            | FailureType::Protocol
            | FailureType::AuthRedirect => {
                Some(format!("-ERR [SYS/TEMP] {LOGIN_PROXY_FAILURE_MSG}\r\n").into_bytes())
            }
            FailureType::InternalConfig
            | FailureType::RemoteConfig
            | FailureType::AuthNotReplied => {
                Some(format!("-ERR {LOGIN_PROXY_FAILURE_MSG}\r\n").into_bytes())
            }
            // the [SYS/TEMP] prefix is already part of the reason
            FailureType::AuthTempfail => Some(format!("-ERR {reason}\r\n").into_bytes()),
            // the backend's reply line was already relayed
            FailureType::AuthReplied => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::referral::RedirectHost;
    use crate::sasl::Mechanism;

    fn client(mech: Option<Mechanism>) -> Arc<ClientSession> {
        let mut client = ClientSession::new("alice", "alice");
        client.proxy_password = Some("secret".to_string());
        client.proxy_mech = mech;
        client.set_proxy_ttl(5);
        client.remote_port = 50813;
        client.session_id = "s1".to_string();
        Arc::new(client)
    }

    fn driver(mech: Option<Mechanism>, ssl_flags: SslFlags) -> Pop3Driver {
        Pop3Driver::new(client(mech), ssl_flags)
    }

    fn sent(action: &DriverAction) -> &str {
        match action {
            DriverAction::SendServer(bytes) => std::str::from_utf8(bytes).unwrap(),
            other => panic!("expected SendServer, got {other:?}"),
        }
    }

    #[test]
    fn user_pass_flow_without_sasl() {
        let mut driver = driver(None, SslFlags::empty());

        let actions = driver.handle_line("+OK hello");
        assert_eq!(actions.len(), 1);
        assert_eq!(sent(&actions[0]), "USER alice\r\n");
        assert_eq!(driver.state_name(), "login1");

        let actions = driver.handle_line("+OK");
        assert_eq!(sent(&actions[0]), "PASS secret\r\n");
        assert_eq!(driver.state_name(), "login2");

        let actions = driver.handle_line("+OK done");
        assert_eq!(
            actions[0],
            DriverAction::SendClient(b"+OK done\r\n".to_vec())
        );
        assert_eq!(actions[1], DriverAction::Detach);
    }

    #[test]
    fn auth_plain_sends_initial_response_inline() {
        let mut driver = driver(Some(Mechanism::Plain), SslFlags::empty());
        let actions = driver.handle_line("+OK ready");
        assert_eq!(sent(&actions[0]), "AUTH PLAIN AGFsaWNlAHNlY3JldA==\r\n");
        assert_eq!(driver.state_name(), "login2");

        let actions = driver.handle_line("+OK logged in");
        assert_eq!(
            actions[0],
            DriverAction::SendClient(b"+OK logged in\r\n".to_vec())
        );
        assert_eq!(actions[1], DriverAction::Detach);
    }

    #[test]
    fn master_user_becomes_authid_with_user_as_authzid() {
        let mut client = ClientSession::new("alice", "alice");
        client.proxy_password = Some("ms".to_string());
        client.proxy_master_user = Some("master".to_string());
        client.proxy_mech = Some(Mechanism::Plain);
        client.set_proxy_ttl(5);
        let mut driver = Pop3Driver::new(Arc::new(client), SslFlags::empty());

        let actions = driver.handle_line("+OK ready");
        let expected = BASE64.encode(b"alice\0master\0ms");
        assert_eq!(sent(&actions[0]), format!("AUTH PLAIN {expected}\r\n"));
    }

    #[test]
    fn auth_login_walks_the_continuation_rounds() {
        let mut driver = driver(Some(Mechanism::Login), SslFlags::empty());
        let actions = driver.handle_line("+OK ready");
        assert_eq!(sent(&actions[0]), "AUTH LOGIN =\r\n");

        let actions = driver.handle_line("+ VXNlcm5hbWU6");
        assert_eq!(sent(&actions[0]), "YWxpY2U=\r\n");

        let actions = driver.handle_line("+ UGFzc3dvcmQ6");
        assert_eq!(sent(&actions[0]), "c2VjcmV0\r\n");

        let actions = driver.handle_line("+OK logged in");
        assert_eq!(actions[1], DriverAction::Detach);
    }

    #[test]
    fn bad_base64_continuation_is_a_protocol_failure() {
        let mut driver = driver(Some(Mechanism::Login), SslFlags::empty());
        driver.handle_line("+OK ready");
        let actions = driver.handle_line("+ !!!not-base64!!!");
        match &actions[0] {
            DriverAction::Fail(failure) => {
                assert_eq!(failure.kind, FailureType::Protocol);
                assert_eq!(failure.reason, "Invalid base64 data in AUTH response");
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn xclient_line_carries_session_metadata_and_forward_fields() {
        let mut client = ClientSession::new("alice", "alice");
        client.proxy_password = Some("secret".to_string());
        client.set_proxy_ttl(5);
        client.ip = "192.0.2.9".parse().unwrap();
        client.remote_port = 50813;
        client.session_id = "s1".to_string();
        client.local_name = Some("mail.example.com".to_string());
        client.end_client_tls_secured = true;
        client.auth_passdb_args = vec![
            "forward_quota=1G".to_string(),
            "forward_note=tab\tchar".to_string(),
        ];
        let mut driver = Pop3Driver::new(Arc::new(client), SslFlags::empty());

        let actions = driver.handle_line("+OK [XCLIENT] POP3 ready");
        let fwd = BASE64.encode("quota=1G\tnote=tab\\tchar".as_bytes());
        assert_eq!(
            sent(&actions[0]),
            format!(
                "XCLIENT ADDR=192.0.2.9 PORT=50813 SESSION=s1 TTL=4 \
                 CLIENT-TRANSPORT=TLS DESTNAME=mail.example.com FORWARD={fwd}\r\n"
            )
        );
        assert_eq!(sent(&actions[1]), "USER alice\r\n");
        assert_eq!(driver.state_name(), "xclient");

        // XCLIENT acknowledged, then the USER reply drives login onward
        assert!(driver.handle_line("+OK").is_empty());
        assert_eq!(driver.state_name(), "login1");
    }

    #[test]
    fn untrusted_clients_never_send_xclient() {
        let mut client = ClientSession::new("alice", "alice");
        client.proxy_password = Some("secret".to_string());
        client.set_proxy_ttl(5);
        client.proxy_not_trusted = true;
        let mut driver = Pop3Driver::new(Arc::new(client), SslFlags::empty());

        let actions = driver.handle_line("+OK [XCLIENT] ready");
        assert_eq!(sent(&actions[0]), "USER alice\r\n");
        assert_eq!(driver.state_name(), "login1");
    }

    #[test]
    fn starttls_is_requested_before_login() {
        let mut driver = driver(None, SslFlags::YES | SslFlags::STARTTLS);
        let actions = driver.handle_line("+OK hello");
        assert_eq!(sent(&actions[0]), "STLS\r\n");
        assert_eq!(driver.state_name(), "starttls");

        let actions = driver.handle_line("+OK begin TLS");
        assert_eq!(actions[0], DriverAction::StartTls);
        assert_eq!(sent(&actions[1]), "USER alice\r\n");
    }

    #[test]
    fn stls_rejection_is_a_remote_failure() {
        let mut driver = driver(None, SslFlags::YES | SslFlags::STARTTLS);
        driver.handle_line("+OK hello");
        let actions = driver.handle_line("-ERR no TLS here");
        match &actions[0] {
            DriverAction::Fail(failure) => assert_eq!(failure.kind, FailureType::Remote),
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn invalid_banner_is_a_protocol_failure() {
        let mut driver = driver(None, SslFlags::empty());
        let actions = driver.handle_line("*GARBAGE");
        match &actions[0] {
            DriverAction::Fail(failure) => {
                assert_eq!(failure.kind, FailureType::Protocol);
                assert!(failure.reason.starts_with("Invalid banner: "));
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn sys_temp_errors_defer_the_client_reply() {
        let mut driver = driver(None, SslFlags::empty());
        driver.handle_line("+OK hello");
        let actions = driver.handle_line("-ERR [SYS/TEMP] mailbox moving");
        assert_eq!(actions.len(), 1);
        match &actions[0] {
            DriverAction::Fail(failure) => {
                assert_eq!(failure.kind, FailureType::AuthTempfail);
                assert_eq!(failure.reason, "[SYS/TEMP] mailbox moving");
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn referral_errors_become_redirects() {
        let mut driver = driver(None, SslFlags::empty());
        driver.handle_line("+OK hello");
        let actions = driver.handle_line("-ERR [REFERRAL/pop3://bob@10.0.0.2:110] go away");
        match &actions[0] {
            DriverAction::Redirect(target) => {
                assert_eq!(target.user.as_deref(), Some("bob"));
                assert_eq!(target.host, RedirectHost::Ip("10.0.0.2".parse().unwrap()));
                assert_eq!(target.port, Some(110));
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn backend_error_lines_are_forwarded_verbatim() {
        let mut driver = driver(None, SslFlags::empty());
        driver.handle_line("+OK hello");
        let actions = driver.handle_line("-ERR no such user");
        assert_eq!(
            actions[0],
            DriverAction::SendClient(b"-ERR no such user\r\n".to_vec())
        );
        match &actions[1] {
            DriverAction::Fail(failure) => {
                assert_eq!(failure.kind, FailureType::AuthReplied);
                assert_eq!(failure.reason, "no such user");
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn non_err_rejections_get_the_generic_auth_failure() {
        let mut driver = driver(None, SslFlags::empty());
        driver.handle_line("+OK hello");
        let actions = driver.handle_line("BYE");
        assert_eq!(
            actions[0],
            DriverAction::SendClient(b"-ERR Authentication failed.\r\n".to_vec())
        );
    }

    #[test]
    fn reset_rewinds_to_banner() {
        let mut driver = driver(Some(Mechanism::Plain), SslFlags::empty());
        driver.handle_line("+OK ready");
        assert_eq!(driver.state_name(), "login2");
        driver.reset();
        assert_eq!(driver.state_name(), "banner");
        let actions = driver.handle_line("+OK ready again");
        assert_eq!(sent(&actions[0]), "AUTH PLAIN AGFsaWNlAHNlY3JldA==\r\n");
    }

    #[test]
    fn failure_replies_map_the_taxonomy() {
        let driver = driver(None, SslFlags::empty());
        assert_eq!(
            driver.failure_reply(FailureType::Connect, "x").unwrap(),
            b"-ERR [SYS/TEMP] Account is temporarily unavailable.\r\n".to_vec()
        );
        assert_eq!(
            driver.failure_reply(FailureType::RemoteConfig, "x").unwrap(),
            b"-ERR Account is temporarily unavailable.\r\n".to_vec()
        );
        assert_eq!(
            driver
                .failure_reply(FailureType::AuthTempfail, "[SYS/TEMP] moving")
                .unwrap(),
            b"-ERR [SYS/TEMP] moving\r\n".to_vec()
        );
        assert_eq!(driver.failure_reply(FailureType::AuthReplied, "x"), None);
    }
}
