//! DNS interceptor integration tests
//!
//! Queries are built and answers decoded with `hickory-proto`, so the
//! interceptor's codec is checked against an independent implementation.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::net::UdpSocket;
use tokio::sync::oneshot;

use captive_portal::dns::DnsInterceptor;

const GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 42, 0, 1);

async fn start(max_in_flight: usize) -> (Arc<DnsInterceptor>, oneshot::Sender<()>) {
    let server = Arc::new(
        DnsInterceptor::bind("127.0.0.1:0".parse().unwrap(), GATEWAY, 30, max_in_flight)
            .await
            .unwrap(),
    );
    let (tx, rx) = oneshot::channel();
    let runner = Arc::clone(&server);
    tokio::spawn(async move { runner.run_until_shutdown(rx).await });
    (server, tx)
}

fn build_query(id: u16, name: &str, record_type: RecordType) -> Vec<u8> {
    let mut message = Message::new();
    message.set_id(id);
    message.set_recursion_desired(true);
    message.add_query(Query::query(Name::from_ascii(name).unwrap(), record_type));
    message.to_vec().unwrap()
}

async fn ask(server: SocketAddr, datagram: &[u8]) -> Option<Message> {
    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    client.send_to(datagram, server).await.unwrap();
    let mut buf = [0u8; 1500];
    match tokio::time::timeout(Duration::from_millis(500), client.recv_from(&mut buf)).await {
        Ok(Ok((len, _))) => Some(Message::from_vec(&buf[..len]).unwrap()),
        _ => None,
    }
}

// ============================================================================
// Answer Shape
// ============================================================================

#[tokio::test]
async fn test_a_query_resolves_to_gateway() {
    let (server, _shutdown) = start(16).await;

    let answer = ask(
        server.local_addr(),
        &build_query(0x4242, "connectivitycheck.gstatic.com.", RecordType::A),
    )
    .await
    .expect("no answer");

    assert_eq!(answer.id(), 0x4242);
    assert_eq!(answer.message_type(), MessageType::Response);
    assert_eq!(answer.op_code(), OpCode::Query);
    assert_eq!(answer.response_code(), ResponseCode::NoError);
    assert!(answer.recursion_desired());

    assert_eq!(answer.queries().len(), 1);
    assert_eq!(
        answer.queries()[0].name(),
        &Name::from_ascii("connectivitycheck.gstatic.com.").unwrap()
    );

    assert_eq!(answer.answers().len(), 1);
    let record = &answer.answers()[0];
    assert_eq!(record.ttl(), 30);
    assert_eq!(record.name(), answer.queries()[0].name());
    match record.data() {
        Some(RData::A(a)) => assert_eq!(a.0, GATEWAY),
        other => panic!("unexpected record data: {other:?}"),
    }
    assert!(answer.name_servers().is_empty());
    assert!(answer.additionals().is_empty());
}

#[tokio::test]
async fn test_every_question_type_gets_the_gateway() {
    let (server, _shutdown) = start(16).await;

    for record_type in [RecordType::AAAA, RecordType::MX, RecordType::TXT] {
        let answer = ask(
            server.local_addr(),
            &build_query(7, "example.org.", record_type),
        )
        .await
        .expect("no answer");

        // The question is echoed unchanged; the answer is always an A record
        assert_eq!(answer.queries()[0].query_type(), record_type);
        assert!(matches!(answer.answers()[0].data(), Some(RData::A(a)) if a.0 == GATEWAY));
    }
}

#[tokio::test]
async fn test_root_name_is_answered() {
    let (server, _shutdown) = start(4).await;

    let answer = ask(server.local_addr(), &build_query(1, ".", RecordType::A))
        .await
        .expect("no answer");
    assert!(answer.queries()[0].name().is_root());
}

// ============================================================================
// Malformed Input
// ============================================================================

#[tokio::test]
async fn test_garbage_is_ignored_and_server_keeps_answering() {
    let (server, _shutdown) = start(4).await;

    assert!(ask(server.local_addr(), &[0xFF; 5]).await.is_none());

    // Response bit set: not a query
    let mut response = build_query(2, "example.com.", RecordType::A);
    response[2] |= 0x80;
    assert!(ask(server.local_addr(), &response).await.is_none());

    let answer = ask(server.local_addr(), &build_query(3, "example.com.", RecordType::A)).await;
    assert!(answer.is_some());

    let stats = server.stats().snapshot();
    assert_eq!(stats.queries_received, 3);
    assert_eq!(stats.malformed, 2);
    assert_eq!(stats.answers_sent, 1);
}

#[tokio::test]
async fn test_many_clients_all_answered() {
    let (server, _shutdown) = start(64).await;
    let addr = server.local_addr();

    let mut tasks = Vec::new();
    for id in 0..32u16 {
        tasks.push(tokio::spawn(async move {
            let name = format!("host{id}.example.net.");
            let answer = ask(addr, &build_query(id, &name, RecordType::A)).await;
            answer.map(|m| m.id())
        }));
    }

    for (id, task) in tasks.into_iter().enumerate() {
        assert_eq!(task.await.unwrap(), Some(id as u16));
    }
}
