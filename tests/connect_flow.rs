//! Full connection flow against a scripted OpenVPN and a real callback listener

use std::collections::VecDeque;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use samlvpn::openvpn::command::STDIN_AUTH_SOURCE;
use samlvpn::process::ExecError;
use samlvpn::saml::{CallbackError, ProbeError};
use samlvpn::vpn::{ResolutionError, SupervisorError};
use samlvpn::{
    Config, Connection, Error, Execute, Outcome, Resolve, RunOutput, SamlVpn, SessionContext,
    Stream, VpnCommand,
};
use tempfile::TempDir;
use tokio::sync::{Notify, mpsc};

const CHALLENGE: &str = "\
Fri Sep 25 13:12:53 2020 TLS: Initial packet from [AF_INET]192.0.2.10:443
Fri Sep 25 13:12:53 2020 AUTH: Received control message: AUTH_FAILED,CRV1:R:instance-1/6876397182473095132/690502db-7813-4267-9706-be0838081823:b'Ti9B':https://samlwebsite.com/app/clientvpn/someURL
Fri Sep 25 13:12:53 2020 SIGTERM[soft,auth-failure] received, process exiting";

const SID: &str = "instance-1/6876397182473095132/690502db-7813-4267-9706-be0838081823";

const AUTH_FAILED: &str = "AUTH: Received control message: AUTH_FAILED";

const CONNECTED: &str = "\
Fri Sep 25 13:13:40 2020 Initialization Sequence Completed
Fri Sep 25 14:02:11 2020 Inactivity timeout (--ping-restart), restarting
Fri Sep 25 14:02:11 2020 SIGTERM[soft,ping-restart] received, process exiting";

struct FixedResolver {
    lookups: AtomicUsize,
}

impl FixedResolver {
    fn new() -> Self {
        Self {
            lookups: AtomicUsize::new(0),
        }
    }
}

impl Resolve for FixedResolver {
    async fn resolve(&self, host: &str) -> Result<IpAddr, ResolutionError> {
        assert_eq!(host, "vpn.example.com");
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)))
    }
}

/// Plays OpenVPN: answers the probe with a challenge (and has the "browser"
/// post a SAML response to the callback port it was given), then replays one
/// scripted session per run.
struct FakeOpenVpn {
    probe: RunOutput,
    post_assertion: bool,
    sessions: Mutex<VecDeque<RunOutput>>,
    /// Sessions never exit on their own.
    hang_sessions: bool,
    session_started: Notify,
    commands: Mutex<Vec<VpnCommand>>,
    credentials_seen: Mutex<Vec<Option<String>>>,
}

impl FakeOpenVpn {
    fn new(sessions: &[(&str, i32)]) -> Self {
        Self {
            probe: output(CHALLENGE, 1),
            post_assertion: true,
            sessions: Mutex::new(sessions.iter().map(|(t, c)| output(t, *c)).collect()),
            hang_sessions: false,
            session_started: Notify::new(),
            commands: Mutex::new(Vec::new()),
            credentials_seen: Mutex::new(Vec::new()),
        }
    }

    fn commands(&self) -> Vec<VpnCommand> {
        self.commands.lock().unwrap().clone()
    }

    fn credentials_seen(&self) -> Vec<Option<String>> {
        self.credentials_seen.lock().unwrap().clone()
    }
}

impl Execute for FakeOpenVpn {
    fn run<F>(
        &self,
        command: &VpnCommand,
        mut on_line: F,
    ) -> impl Future<Output = Result<RunOutput, ExecError>> + Send
    where
        F: FnMut(Stream, &str) + Send,
    {
        self.commands.lock().unwrap().push(command.clone());

        let output = match &command.stdin {
            Some(placeholder) => {
                let port: u16 = placeholder
                    .rsplit("ACS::")
                    .next()
                    .unwrap()
                    .trim()
                    .parse()
                    .unwrap();
                if self.post_assertion {
                    tokio::spawn(post_assertion(port));
                }
                self.probe.clone()
            }
            None => {
                let path = command.args.last().unwrap();
                self.credentials_seen
                    .lock()
                    .unwrap()
                    .push(std::fs::read_to_string(path).ok());
                self.session_started.notify_one();
                self.sessions
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_default()
            }
        };

        for line in &output.lines {
            on_line(Stream::Stdout, line);
        }
        let hang = self.hang_sessions && command.stdin.is_none();
        async move {
            if hang {
                std::future::pending::<()>().await;
            }
            Ok(output)
        }
    }
}

fn output(text: &str, exit_code: i32) -> RunOutput {
    RunOutput {
        exit_code: Some(exit_code),
        lines: text.lines().map(String::from).collect(),
    }
}

async fn post_assertion(port: u16) {
    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    let response = client
        .post(format!("http://127.0.0.1:{}/", port))
        .header("Content-Type", "application/x-www-form-urlencoded")
        .body("SAMLResponse=PHNhbWw%2BdGVzdA%3D%3D&RelayState=")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
}

fn expected_payload() -> String {
    format!("N/A\nCRV1::{}::PHNhbWw+dGVzdA==", SID)
}

fn config(dir: &Path) -> Config {
    Config {
        openvpn_config_file: PathBuf::from("/etc/openvpn/client.ovpn"),
        server_address: SocketAddr::from(([127, 0, 0, 1], 0)),
        server_timeout_secs: 5,
        probe_timeout_secs: 5,
        browser_command: Vec::new(),
        use_sudo: false,
        temp_credentials_file_path: dir.join("credentials"),
        temp_credentials_file_permissions: 0o600,
        ..Config::default()
    }
}

fn context() -> SessionContext {
    SessionContext {
        host: "vpn.example.com".to_string(),
        port: 443,
        protocol: "udp".to_string(),
        binary: PathBuf::from("openvpn"),
        config_path: PathBuf::from("/etc/openvpn/client.ovpn"),
    }
}

fn arg_after<'a>(command: &'a VpnCommand, flag: &str) -> &'a str {
    let i = command.args.iter().position(|a| a == flag).unwrap();
    &command.args[i + 1]
}

#[tokio::test]
async fn test_connect_until_connection_lost() {
    let temp_dir = TempDir::new().unwrap();
    let marker = temp_dir.path().join("lost");
    let config = Config {
        connection_lost_command: vec!["touch".to_string(), marker.to_string_lossy().into_owned()],
        ..config(temp_dir.path())
    };
    let openvpn = FakeOpenVpn::new(&[(CONNECTED, 0)]);
    let resolver = FixedResolver::new();
    let vpn = SamlVpn::with_parts(config, context(), &resolver, &openvpn);

    let connection = vpn.connect().await.unwrap();

    assert_eq!(connection, Connection::Finished(Outcome::ConnectionLost));

    let commands = openvpn.commands();
    assert_eq!(commands.len(), 2);

    let probe = &commands[0];
    assert_eq!(arg_after(probe, "--remote"), "vpn.example.com");
    assert_eq!(arg_after(probe, "--auth-user-pass"), STDIN_AUTH_SOURCE);
    assert!(probe.stdin.as_deref().unwrap().starts_with("N/A\nACS::"));

    let session = &commands[1];
    assert_eq!(arg_after(session, "--remote"), "192.0.2.10");
    assert!(session.args.iter().any(|a| a == "--auth-nocache"));
    assert!(session.stdin.is_none());

    assert_eq!(openvpn.credentials_seen(), vec![Some(expected_payload())]);
    assert!(!temp_dir.path().join("credentials").exists());
    assert!(marker.exists());
}

#[tokio::test]
async fn test_connect_retries_after_auth_failure() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        auth_failed_retries: 1,
        ..config(temp_dir.path())
    };
    let openvpn = FakeOpenVpn::new(&[(AUTH_FAILED, 1), ("", 0)]);
    let resolver = FixedResolver::new();
    let vpn = SamlVpn::with_parts(config, context(), &resolver, &openvpn);

    let connection = vpn.connect().await.unwrap();

    assert_eq!(connection, Connection::Finished(Outcome::Success));
    assert_eq!(openvpn.commands().len(), 3);
    assert_eq!(resolver.lookups.load(Ordering::SeqCst), 2);
    assert_eq!(
        openvpn.credentials_seen(),
        vec![Some(expected_payload()), Some(expected_payload())]
    );
    assert!(!temp_dir.path().join("credentials").exists());
}

#[tokio::test]
async fn test_connect_auth_failure_without_retries() {
    let temp_dir = TempDir::new().unwrap();
    let openvpn = FakeOpenVpn::new(&[(AUTH_FAILED, 1)]);
    let vpn = SamlVpn::with_parts(
        config(temp_dir.path()),
        context(),
        FixedResolver::new(),
        &openvpn,
    );

    let err = vpn.connect().await.unwrap_err();

    assert!(matches!(
        err,
        Error::Supervisor(SupervisorError::AuthFailed { attempts: 1 })
    ));
    assert_eq!(openvpn.commands().len(), 2);
    assert!(!temp_dir.path().join("credentials").exists());
}

#[tokio::test]
async fn test_print_only_leaves_credentials() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config {
        run_command: false,
        ..config(temp_dir.path())
    };
    let openvpn = FakeOpenVpn::new(&[]);
    let vpn = SamlVpn::with_parts(config, context(), FixedResolver::new(), &openvpn);

    let connection = vpn.connect().await.unwrap();

    let Connection::Printed(command) = connection else {
        panic!("expected a printed command, got {:?}", connection);
    };
    let credentials = temp_dir.path().join("credentials");
    assert_eq!(
        arg_after(&command, "--auth-user-pass"),
        credentials.to_str().unwrap()
    );
    assert_eq!(std::fs::read_to_string(&credentials).unwrap(), expected_payload());
    // Only the probe ran
    assert_eq!(openvpn.commands().len(), 1);
}

#[tokio::test]
async fn test_probe_without_challenge() {
    let temp_dir = TempDir::new().unwrap();
    let openvpn = FakeOpenVpn {
        probe: output("Options error: cannot open client.ovpn", 1),
        ..FakeOpenVpn::new(&[])
    };
    let vpn = SamlVpn::with_parts(
        config(temp_dir.path()),
        context(),
        FixedResolver::new(),
        &openvpn,
    );

    let err = vpn.connect().await.unwrap_err();

    assert!(matches!(err, Error::Probe(ProbeError::Exec { .. })));
    assert!(err.to_string().starts_with("Challenge probe failed"));
    assert!(!temp_dir.path().join("credentials").exists());
}

#[tokio::test]
async fn test_callback_timeout_releases_listener() {
    let temp_dir = TempDir::new().unwrap();

    // Grab a free port, then let the flow bind it.
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();
    let config = Config {
        server_address: SocketAddr::from(([127, 0, 0, 1], port)),
        server_timeout_secs: 1,
        ..config(temp_dir.path())
    };
    let openvpn = FakeOpenVpn {
        post_assertion: false,
        ..FakeOpenVpn::new(&[])
    };
    let vpn = SamlVpn::with_parts(config, context(), FixedResolver::new(), &openvpn);

    let err = vpn.connect().await.unwrap_err();

    assert!(matches!(err, Error::Callback(CallbackError::Timeout(_))));
    assert_eq!(openvpn.commands().len(), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(std::net::TcpListener::bind(("127.0.0.1", port)).is_ok());
}

#[tokio::test]
async fn test_second_interrupt_stops_session_and_erases_credentials() {
    let temp_dir = TempDir::new().unwrap();
    let credentials = temp_dir.path().join("credentials");
    let openvpn = FakeOpenVpn {
        hang_sessions: true,
        ..FakeOpenVpn::new(&[])
    };
    let vpn = SamlVpn::with_parts(
        config(temp_dir.path()),
        context(),
        FixedResolver::new(),
        &openvpn,
    );

    let (tx, rx) = mpsc::unbounded_channel::<()>();
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let interrupt = || {
        let rx = rx.clone();
        async move {
            rx.lock().await.recv().await;
        }
    };

    let press_twice = async {
        openvpn.session_started.notified().await;
        assert!(credentials.exists());
        tx.send(()).unwrap();
        tx.send(()).unwrap();
    };
    let (result, ()) = tokio::join!(vpn.connect_until(interrupt), press_twice);

    assert!(matches!(result, Err(Error::Interrupted)));
    assert_eq!(openvpn.credentials_seen(), vec![Some(expected_payload())]);
    assert!(!credentials.exists());
}

#[tokio::test]
async fn test_single_interrupt_lets_session_finish() {
    let temp_dir = TempDir::new().unwrap();
    let openvpn = FakeOpenVpn::new(&[(
        "Initialization Sequence Completed\nSIGINT[hard,] received, process exiting",
        0,
    )]);
    let vpn = SamlVpn::with_parts(
        config(temp_dir.path()),
        context(),
        FixedResolver::new(),
        &openvpn,
    );

    // One interrupt is pending once the session starts; OpenVPN exits on it.
    let (tx, rx) = mpsc::unbounded_channel::<()>();
    let rx = Arc::new(tokio::sync::Mutex::new(rx));
    let mut calls = 0;
    let interrupt = || {
        calls += 1;
        if calls == 2 {
            tx.send(()).unwrap();
        }
        let rx = rx.clone();
        async move {
            rx.lock().await.recv().await;
        }
    };

    let connection = vpn.connect_until(interrupt).await.unwrap();

    assert_eq!(connection, Connection::Finished(Outcome::Cancelled));
    assert!(!temp_dir.path().join("credentials").exists());
}
