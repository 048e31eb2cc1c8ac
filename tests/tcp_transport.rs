use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use kameo_remoting::{
    address::Address,
    config::{AdapterKind, RemoteSettings, TransportSettings},
    deployer::Deployer,
    error::{DeliveryError, RemoteError, TransportError},
    remoting::InboundMessage,
    transport::{
        registry::AssociationRegistry, tcp::TcpTransport, AssociationEvent, DisassociateInfo,
        HandleEvent, Transport,
    },
    ActorPath, LocalDelivery, RemoteActorRefProvider, Remoting,
};
use tokio::sync::mpsc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("kameo_remoting=debug")
        .try_init();
}

fn address(s: &str) -> Address {
    s.parse().unwrap()
}

struct Echo;

impl LocalDelivery for Echo {
    fn deliver(&self, recipient: &ActorPath, message: InboundMessage) -> Result<(), DeliveryError> {
        if recipient.name() != Some("echo") {
            return Err(DeliveryError::UnknownRecipient(recipient.to_string()));
        }
        if let InboundMessage::Ask { payload, reply_to } = message {
            tokio::spawn(reply_to.reply(payload));
        }
        Ok(())
    }

    fn create_child(&self, _path: &ActorPath, _supervisor: &ActorPath) -> Result<(), DeliveryError> {
        Ok(())
    }
}

async fn listening(address: Address) -> (TcpTransport, Address, mpsc::UnboundedReceiver<AssociationEvent>) {
    let transport = TcpTransport::new(address);
    let (bound, slot) = transport.listen().await.unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    slot.fill(tx);
    (transport, bound, rx)
}

#[tokio::test]
async fn associates_and_delivers_in_order() {
    init_tracing();

    let (a, a_address, _a_events) = listening(address("tcp://sysA@127.0.0.1")).await;
    let (b, b_address, mut b_events) = listening(address("tcp://sysB@127.0.0.1")).await;
    assert_ne!(a_address.port(), Some(0));

    let outbound = a.associate(b_address.clone()).await.unwrap();
    assert_eq!(outbound.remote_uid(), b.uid());

    let Some(AssociationEvent::InboundAssociation(inbound)) = b_events.recv().await else {
        panic!("expected an inbound association");
    };
    assert_eq!(inbound.remote_address(), &a_address);
    assert_eq!(inbound.remote_uid(), a.uid());

    let (tx, mut rx) = mpsc::unbounded_channel();
    inbound.register_listener(tx).unwrap();
    for i in 0..10u8 {
        outbound.write(Bytes::copy_from_slice(&[i])).await.unwrap();
    }
    for i in 0..10u8 {
        match rx.recv().await {
            Some(HandleEvent::InboundPayload(payload)) => assert_eq!(payload[..], [i]),
            other => panic!("unexpected event {other:?}"),
        }
    }

    outbound.disassociate();
    assert!(matches!(
        rx.recv().await,
        Some(HandleEvent::Disassociated(DisassociateInfo::Normal))
    ));

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn connection_refused_is_an_invalid_association() {
    init_tracing();

    let unused = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = unused.local_addr().unwrap().port();
    drop(unused);

    let (a, _, _a_events) = listening(address("tcp://sysA@127.0.0.1")).await;
    let ghost = address(&format!("tcp://ghost@127.0.0.1:{port}"));
    assert!(matches!(
        a.associate(ghost).await,
        Err(TransportError::InvalidAssociation { .. })
    ));
}

#[tokio::test]
async fn binding_a_taken_port_fails() {
    init_tracing();

    let (_a, a_address, _a_events) = listening(address("tcp://sysA@127.0.0.1")).await;
    let other = TcpTransport::new(a_address);
    assert!(matches!(
        other.listen().await,
        Err(TransportError::Bind { .. })
    ));
}

#[tokio::test]
async fn listening_again_keeps_the_endpoint_and_listener() {
    init_tracing();

    let (a, _, _a_events) = listening(address("tcp://sysA@127.0.0.1")).await;
    let (b, b_address, mut b_events) = listening(address("tcp://sysB@127.0.0.1")).await;

    let (rebound, slot) = b.listen().await.unwrap();
    assert_eq!(rebound, b_address);
    let (tx, mut ignored) = mpsc::unbounded_channel();
    slot.fill(tx);

    a.associate(b_address).await.unwrap();
    let inbound = tokio::time::timeout(Duration::from_secs(5), b_events.recv())
        .await
        .expect("the first listener must be notified");
    assert!(matches!(inbound, Some(AssociationEvent::InboundAssociation(_))));
    assert!(ignored.try_recv().is_err());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn remoting_over_checksummed_tcp() {
    init_tracing();

    let registry = AssociationRegistry::new();
    let settings = |address: &str| RemoteSettings {
        transports: vec![TransportSettings {
            applied_adapters: vec![AdapterKind::Crc32],
            ..TransportSettings::tcp(address.parse().unwrap())
        }],
        ..Default::default()
    };
    let server = Remoting::from_settings(settings("tcp://server@127.0.0.1"), &registry, Arc::new(Echo))
        .await
        .unwrap();
    let client = Remoting::from_settings(settings("tcp://client@127.0.0.1"), &registry, Arc::new(Echo))
        .await
        .unwrap();
    let provider = RemoteActorRefProvider::new(client.clone(), Deployer::new());

    let echo = provider
        .resolve(&format!("{}/user/echo", server.default_address()))
        .await
        .unwrap();
    assert!(echo.is_remote());
    let reply = echo
        .ask(Bytes::from_static(b"over the wire"), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(reply, Bytes::from_static(b"over the wire"));

    let missing = provider
        .resolve(&format!("{}/user/missing", server.default_address()))
        .await
        .unwrap();
    assert!(matches!(
        missing.ask(Bytes::new(), Duration::from_secs(5)).await,
        Err(RemoteError::Delivery(DeliveryError::UnknownRecipient(_)))
    ));

    client.shutdown().await;
    server.shutdown().await;
}
