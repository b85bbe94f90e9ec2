//! Integration tests for client-server SSH flows over loopback TCP:
//! key exchange, host-key policy, user authentication (raw keys,
//! certificates, keyboard-interactive), channel data flow, and the
//! reconnect supervisor.

use std::sync::Arc;
use std::time::Duration;
use tether_platform::{TetherError, TetherResult};
use tether_proto::ssh::cert::{CertChecker, CertSigner, CertType, Certificate};
use tether_proto::ssh::client::{SshClient, SshClientConfig};
use tether_proto::ssh::connection::ChannelType;
use tether_proto::ssh::pubkey::{Ed25519Keypair, PublicKey, Signer};
use tether_proto::ssh::server::{
    KeyboardInteractiveAuth, SshServer, SshServerConfig, SshSession,
};
use tether_proto::ssh::session::{
    Connector, Endpoint, Supervisor, SupervisorConfig,
};
use tokio::time::timeout;

/// Client config that accepts any host key; host-key policy has its own
/// tests below.
fn trusting_client_config() -> SshClientConfig {
    let mut config = SshClientConfig::default();
    config.checker.host_key_fallback = Some(Box::new(|_, _, _| Ok(())));
    config
}

async fn start_server(
    config: SshServerConfig,
    signer: Arc<dyn Signer>,
) -> (std::net::SocketAddr, tokio::task::JoinHandle<TetherResult<SshSession>>) {
    let server = SshServer::bind("127.0.0.1:0", signer, config)
        .await
        .expect("bind");
    let addr = server.local_addr().expect("local addr");
    let handle = tokio::spawn(async move { server.accept().await });
    (addr, handle)
}

#[tokio::test]
async fn none_auth_when_server_allows_it() {
    let mut config = SshServerConfig::default();
    config.no_client_auth = true;

    let (addr, server_task) =
        start_server(config, Arc::new(Ed25519Keypair::generate())).await;

    let mut client = timeout(
        Duration::from_secs(5),
        SshClient::connect(&addr.to_string(), trusting_client_config()),
    )
    .await
    .expect("connect timed out")
    .expect("connect");

    client.authenticate_none("probe").await.expect("none auth");
    assert!(client.is_authenticated());
    assert_eq!(client.username(), Some("probe"));

    let session = server_task.await.unwrap().expect("server handshake");
    assert_eq!(session.username(), "probe");
}

#[tokio::test]
async fn publickey_auth_and_channel_data_flow() {
    let user_key = Ed25519Keypair::generate();
    let authorized = user_key.public_key().marshal();

    let mut config = SshServerConfig::default();
    config.public_key_auth = Some(Box::new(move |user, key| {
        user == "deploy" && key.marshal() == authorized
    }));

    let (addr, server_task) =
        start_server(config, Arc::new(Ed25519Keypair::generate())).await;

    let mut client = SshClient::connect(&addr.to_string(), trusting_client_config())
        .await
        .expect("connect");
    client
        .authenticate_publickey("deploy", &user_key)
        .await
        .expect("publickey auth");

    let mut session = server_task.await.unwrap().expect("server handshake");

    // Client opens the supervisor's stream type; server accepts it.
    let open_fut = client.open_channel(ChannelType::CustomInprocStream, Duration::from_secs(5));
    let accept_fut = session.accept_channel();
    let (client_channel, server_channel) = tokio::join!(open_fut, accept_fut);
    let client_channel = client_channel.expect("open channel");
    let server_channel = server_channel.expect("accept channel");

    // Client to server.
    client_channel.write(b"request bytes").expect("write");
    let received = {
        let ch = Arc::clone(&server_channel);
        tokio::task::spawn_blocking(move || {
            let mut dst = [0u8; 64];
            let n = ch.read(&mut dst).unwrap();
            dst[..n].to_vec()
        })
        .await
        .unwrap()
    };
    assert_eq!(received, b"request bytes");

    // Server to client.
    server_channel.write(b"response bytes").expect("write back");
    let received = {
        let ch = Arc::clone(&client_channel);
        tokio::task::spawn_blocking(move || {
            let mut dst = [0u8; 64];
            let n = ch.read(&mut dst).unwrap();
            dst[..n].to_vec()
        })
        .await
        .unwrap()
    };
    assert_eq!(received, b"response bytes");

    // Client sends EOF; the server drains to EOF.
    client_channel.eof().expect("eof");
    let eof = {
        let ch = Arc::clone(&server_channel);
        tokio::task::spawn_blocking(move || {
            let mut dst = [0u8; 8];
            ch.read(&mut dst)
        })
        .await
        .unwrap()
    };
    assert!(matches!(eof, Err(TetherError::Eof)));
}

#[tokio::test]
async fn wrong_publickey_is_refused() {
    let mut config = SshServerConfig::default();
    config.public_key_auth = Some(Box::new(|_, _| false));

    let (addr, server_task) =
        start_server(config, Arc::new(Ed25519Keypair::generate())).await;

    let mut client = SshClient::connect(&addr.to_string(), trusting_client_config())
        .await
        .expect("connect");

    let stranger = Ed25519Keypair::generate();
    let result = client.authenticate_publickey("deploy", &stranger).await;
    assert!(matches!(result, Err(TetherError::Auth(_))));
    assert!(!client.is_authenticated());

    drop(client);
    let _ = server_task.await.unwrap();
}

#[tokio::test]
async fn certificate_auth_with_trusted_authority() {
    let ca = Ed25519Keypair::generate();
    let user_key = Ed25519Keypair::generate();

    let mut cert = Certificate::new(user_key.public_key(), CertType::User);
    cert.key_id = "deploy@ci".to_string();
    cert.valid_principals = vec!["deploy".to_string()];
    cert.sign_cert(&ca).expect("sign cert");
    let cert_signer = CertSigner::new(cert, Box::new(user_key)).expect("cert signer");

    let ca_blob = ca.public_key().marshal();
    let mut config = SshServerConfig::default();
    config.checker.is_user_authority =
        Some(Box::new(move |key: &PublicKey| key.marshal() == ca_blob));

    let (addr, server_task) =
        start_server(config, Arc::new(Ed25519Keypair::generate())).await;

    let mut client = SshClient::connect(&addr.to_string(), trusting_client_config())
        .await
        .expect("connect");
    client
        .authenticate_publickey("deploy", &cert_signer)
        .await
        .expect("certificate auth");

    let session = server_task.await.unwrap().expect("server handshake");
    assert_eq!(session.username(), "deploy");
}

#[tokio::test]
async fn certificate_from_unknown_authority_is_refused() {
    let ca = Ed25519Keypair::generate();
    let user_key = Ed25519Keypair::generate();

    let mut cert = Certificate::new(user_key.public_key(), CertType::User);
    cert.valid_principals = vec!["deploy".to_string()];
    cert.sign_cert(&ca).expect("sign cert");
    let cert_signer = CertSigner::new(cert, Box::new(user_key)).expect("cert signer");

    // Server trusts nothing.
    let (addr, server_task) = start_server(
        SshServerConfig::default(),
        Arc::new(Ed25519Keypair::generate()),
    )
    .await;

    let mut client = SshClient::connect(&addr.to_string(), trusting_client_config())
        .await
        .expect("connect");
    let result = client.authenticate_publickey("deploy", &cert_signer).await;
    assert!(matches!(result, Err(TetherError::Auth(_))));

    drop(client);
    let _ = server_task.await.unwrap();
}

#[tokio::test]
async fn host_certificate_validated_by_client() {
    let host_ca = Ed25519Keypair::generate();
    let host_key = Ed25519Keypair::generate();

    let mut cert = Certificate::new(host_key.public_key(), CertType::Host);
    cert.key_id = "bastion".to_string();
    cert.valid_principals = vec!["127.0.0.1".to_string()];
    cert.sign_cert(&host_ca).expect("sign host cert");
    let host_signer = CertSigner::new(cert, Box::new(host_key)).expect("host signer");

    let mut server_config = SshServerConfig::default();
    server_config.no_client_auth = true;
    let (addr, server_task) = start_server(server_config, Arc::new(host_signer)).await;
    let dialed = addr.to_string();

    // Trust the CA exactly for the address we dial.
    let ca_blob = host_ca.public_key().marshal();
    let expected_addr = dialed.clone();
    let mut client_config = SshClientConfig::default();
    client_config.checker.is_host_authority = Some(Box::new(move |key, addr| {
        addr == expected_addr && key.marshal() == ca_blob
    }));

    let mut client = SshClient::connect(&dialed, client_config)
        .await
        .expect("connect with host certificate");
    assert!(matches!(
        client.server_host_key(),
        Some(PublicKey::Certificate(_))
    ));

    client.authenticate_none("probe").await.expect("auth");
    let _ = server_task.await.unwrap().expect("server handshake");
}

#[tokio::test]
async fn host_certificate_from_untrusted_authority_fails_dial() {
    let host_ca = Ed25519Keypair::generate();
    let host_key = Ed25519Keypair::generate();

    let mut cert = Certificate::new(host_key.public_key(), CertType::Host);
    cert.valid_principals = vec!["127.0.0.1".to_string()];
    cert.sign_cert(&host_ca).expect("sign host cert");
    let host_signer = CertSigner::new(cert, Box::new(host_key)).expect("host signer");

    let (addr, server_task) =
        start_server(SshServerConfig::default(), Arc::new(host_signer)).await;

    // No oracles installed: the client trusts no authority.
    let result = SshClient::connect(&addr.to_string(), SshClientConfig::default()).await;
    assert!(matches!(result, Err(TetherError::Policy(_))));

    let _ = server_task.await.unwrap();
}

#[tokio::test]
async fn keyboard_interactive_auth() {
    let mut config = SshServerConfig::default();
    config.keyboard_interactive = Some(KeyboardInteractiveAuth {
        prompt: "Verification code: ".to_string(),
        verify: Box::new(|user, code| user == "deploy" && code == "123456"),
    });

    let (addr, server_task) =
        start_server(config, Arc::new(Ed25519Keypair::generate())).await;

    let mut client = SshClient::connect(&addr.to_string(), trusting_client_config())
        .await
        .expect("connect");
    client
        .authenticate_keyboard_interactive("deploy", |request| {
            assert_eq!(request.prompts.len(), 1);
            assert!(request.prompts[0].prompt.contains("Verification code"));
            vec!["123456".to_string()]
        })
        .await
        .expect("keyboard-interactive auth");

    let session = server_task.await.unwrap().expect("server handshake");
    assert_eq!(session.username(), "deploy");
}

#[tokio::test]
async fn keyboard_interactive_wrong_code_refused() {
    let mut config = SshServerConfig::default();
    config.keyboard_interactive = Some(KeyboardInteractiveAuth {
        prompt: "Verification code: ".to_string(),
        verify: Box::new(|_, code| code == "123456"),
    });

    let (addr, server_task) =
        start_server(config, Arc::new(Ed25519Keypair::generate())).await;

    let mut client = SshClient::connect(&addr.to_string(), trusting_client_config())
        .await
        .expect("connect");
    let result = client
        .authenticate_keyboard_interactive("deploy", |_| vec!["000000".to_string()])
        .await;
    assert!(matches!(result, Err(TetherError::Auth(_))));

    drop(client);
    let _ = server_task.await.unwrap();
}

#[tokio::test]
async fn idle_timeout_fails_read_but_channel_survives() {
    let mut config = SshServerConfig::default();
    config.no_client_auth = true;
    let (addr, server_task) =
        start_server(config, Arc::new(Ed25519Keypair::generate())).await;

    let mut client = SshClient::connect(&addr.to_string(), trusting_client_config())
        .await
        .expect("connect");
    client.authenticate_none("probe").await.expect("auth");
    let mut session = server_task.await.unwrap().expect("server handshake");

    let open_fut = client.open_channel(ChannelType::CustomInprocStream, Duration::from_secs(5));
    let (client_channel, server_channel) = tokio::join!(open_fut, session.accept_channel());
    let client_channel = client_channel.expect("open");
    let server_channel = server_channel.expect("accept");

    client_channel.set_idle_timeout(Duration::from_millis(80));

    // No traffic: the read times out, the channel does not close.
    let timed_out = {
        let ch = Arc::clone(&client_channel);
        tokio::task::spawn_blocking(move || {
            let mut dst = [0u8; 8];
            ch.read(&mut dst)
        })
        .await
        .unwrap()
    };
    assert!(matches!(timed_out, Err(TetherError::Timeout(_))));

    // Data still flows afterwards.
    server_channel.write(b"late data").expect("write");
    let read = {
        let ch = Arc::clone(&client_channel);
        tokio::task::spawn_blocking(move || {
            let mut dst = [0u8; 32];
            let mut waited = 0;
            loop {
                match ch.read(&mut dst) {
                    Ok(n) => return Ok(dst[..n].to_vec()),
                    Err(TetherError::Timeout(_)) if waited < 50 => {
                        waited += 1;
                        std::thread::sleep(Duration::from_millis(10));
                        ch.idle_timer().reset();
                    }
                    Err(e) => return Err(e),
                }
            }
        })
        .await
        .unwrap()
    };
    assert_eq!(read.unwrap(), b"late data");
}

fn connector_to(user_key: Arc<Ed25519Keypair>) -> Connector {
    Arc::new(move |endpoint: Endpoint, _config: SupervisorConfig| {
        let user_key = Arc::clone(&user_key);
        Box::pin(async move {
            let mut client =
                SshClient::connect(&endpoint.addr(), trusting_client_config()).await?;
            client
                .authenticate_publickey(&endpoint.user, user_key.as_ref())
                .await?;
            Ok(client)
        })
    })
}

#[tokio::test]
async fn supervisor_reconnects_and_empty_map_after_close() {
    let user_key = Arc::new(Ed25519Keypair::generate());
    let authorized = user_key.public_key().marshal();

    let mut config = SshServerConfig::default();
    config.public_key_auth = Some(Box::new(move |_, key| key.marshal() == authorized));

    let (addr, server_task) =
        start_server(config, Arc::new(Ed25519Keypair::generate())).await;

    let mut supervisor_config = SupervisorConfig::default();
    supervisor_config.idle_timeout_dur = Duration::from_secs(30);
    let mut supervisor = Supervisor::new(supervisor_config, connector_to(user_key));

    let endpoint = Endpoint::parse("deploy", &addr.to_string()).expect("endpoint");
    supervisor.reconnect(endpoint).await.expect("reconnect");

    let status = supervisor.status().await.expect("status");
    assert!(status.connected);
    assert_eq!(status.channels, 0);

    let mut session = server_task.await.unwrap().expect("server handshake");

    // Open a logical channel through the supervisor.
    let open_fut = supervisor.open_channel();
    let (channel, server_channel) = tokio::join!(open_fut, session.accept_channel());
    let channel = channel.expect("supervisor open");
    let server_channel = server_channel.expect("server accept");

    let status = supervisor.status().await.expect("status");
    assert_eq!(status.channels, 1);

    // Keepalive probes are answered by the attached consumer without
    // disturbing the stream.
    server_channel.send_keepalive().expect("keepalive");

    channel.write(b"via supervisor").expect("write");
    let received = {
        let ch = Arc::clone(&server_channel);
        tokio::task::spawn_blocking(move || {
            let mut dst = [0u8; 64];
            let n = ch.read(&mut dst).unwrap();
            dst[..n].to_vec()
        })
        .await
        .unwrap()
    };
    assert_eq!(received, b"via supervisor");

    // Close from both sides; the supervisor's map must drain.
    channel.close().expect("client close");
    let server_saw_eof = {
        let ch = Arc::clone(&server_channel);
        tokio::task::spawn_blocking(move || {
            let mut dst = [0u8; 8];
            ch.read(&mut dst)
        })
        .await
        .unwrap()
    };
    assert!(matches!(server_saw_eof, Err(TetherError::Eof)));
    server_channel.close().expect("server close");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = supervisor.status().await.expect("status");
        if status.channels == 0 {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("supervisor map still holds {} channels", status.channels);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    supervisor.halt().await;
}

#[tokio::test]
async fn supervisor_halt_closes_channels() {
    let user_key = Arc::new(Ed25519Keypair::generate());
    let authorized = user_key.public_key().marshal();

    let mut config = SshServerConfig::default();
    config.public_key_auth = Some(Box::new(move |_, key| key.marshal() == authorized));

    let (addr, server_task) =
        start_server(config, Arc::new(Ed25519Keypair::generate())).await;

    let mut supervisor = Supervisor::new(SupervisorConfig::default(), connector_to(user_key));
    let endpoint = Endpoint::parse("deploy", &addr.to_string()).expect("endpoint");
    supervisor.reconnect(endpoint).await.expect("reconnect");

    let mut session = server_task.await.unwrap().expect("server handshake");
    let (channel, _server_channel) =
        tokio::join!(supervisor.open_channel(), session.accept_channel());
    let channel = channel.expect("open");

    supervisor.halt().await;

    // The channel's cancellation handle fired.
    let mut dst = [0u8; 4];
    assert!(channel.read(&mut dst).is_err());
    assert!(matches!(
        supervisor.status().await,
        Err(TetherError::Closed(_))
    ));
}
