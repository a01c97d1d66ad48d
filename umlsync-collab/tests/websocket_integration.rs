//! End-to-end tests over a real WebSocket connection.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use umlsync_collab::{JoinRequest, MessageType, ServerConfig, SyncMessage, SyncServer};
use umlsync_core::{DiagramState, PatchOperation};
use uuid::Uuid;

async fn start_server() -> (Arc<SyncServer>, SocketAddr) {
    let server = Arc::new(SyncServer::new(ServerConfig::for_testing()).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let running = Arc::clone(&server);
    tokio::spawn(async move {
        let _ = running.serve(listener).await;
    });
    (server, addr)
}

struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    view_id: Uuid,
    diagram_id: Uuid,
    initial: DiagramState,
}

impl Client {
    async fn join(addr: SocketAddr, diagram_id: Uuid, user: &str) -> Self {
        Self::join_as(addr, diagram_id, user, Uuid::new_v4()).await
    }

    /// Join proposing `proposed` as view id. The server assigns its own,
    /// which arrives on the first StateReplaced.
    async fn join_as(addr: SocketAddr, diagram_id: Uuid, user: &str, proposed: Uuid) -> Self {
        let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}")).await.unwrap();
        let mut client = Self {
            ws,
            view_id: proposed,
            diagram_id,
            initial: DiagramState::new(),
        };
        let join = SyncMessage::join(
            proposed,
            diagram_id,
            &JoinRequest {
                user_id: user.to_string(),
                display_name: user.to_uppercase(),
            },
        )
        .unwrap();
        client.send(join).await;

        let first = client.recv_type(MessageType::StateReplaced).await;
        client.view_id = first.view_id;
        client.initial = first.state().unwrap();
        client
    }

    async fn send(&mut self, msg: SyncMessage) {
        self.ws.send(Message::Binary(msg.encode().unwrap().into())).await.unwrap();
    }

    async fn submit(&mut self, op: PatchOperation) {
        let msg = SyncMessage::submit(self.view_id, self.diagram_id, &op).unwrap();
        self.send(msg).await;
    }

    async fn recv(&mut self) -> SyncMessage {
        loop {
            let frame = timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("timed out waiting for frame")
                .expect("connection closed")
                .unwrap();
            if let Message::Binary(data) = frame {
                return SyncMessage::decode(&data).unwrap();
            }
        }
    }

    /// Next message of type `wanted`, skipping anything else.
    async fn recv_type(&mut self, wanted: MessageType) -> SyncMessage {
        loop {
            let msg = self.recv().await;
            if msg.msg_type == wanted {
                return msg;
            }
        }
    }
}

fn add_class(id: &str, name: &str, seq: u64) -> PatchOperation {
    PatchOperation::add(
        format!("/elements/{id}"),
        json!({"displayName": name, "kind": "class"}),
    )
    .with_client("ws-client", seq)
}

#[tokio::test]
async fn test_join_receives_current_state() {
    let (_server, addr) = start_server().await;
    let proposed = Uuid::new_v4();
    let client = Client::join_as(addr, Uuid::new_v4(), "alice", proposed).await;

    assert_ne!(client.view_id, proposed);
    assert_eq!(client.initial.version, 0);
}

#[tokio::test]
async fn test_commit_fans_out_to_all_clients() {
    let (server, addr) = start_server().await;
    let diagram = Uuid::new_v4();
    let mut alice = Client::join(addr, diagram, "alice").await;
    let mut bob = Client::join(addr, diagram, "bob").await;

    let joined = alice.recv_type(MessageType::PeerJoined).await;
    assert_eq!(joined.peer().unwrap().user_id, "bob");

    alice.submit(add_class("c1", "Person", 1)).await;

    // Confirmation and fan-out travel separately, so take them in any order.
    let mut confirmed = None;
    let mut replaced = None;
    while confirmed.is_none() || replaced.is_none() {
        let msg = alice.recv().await;
        match msg.msg_type {
            MessageType::OperationConfirmed => confirmed = Some(msg.confirmation().unwrap()),
            MessageType::StateReplaced => replaced = Some(msg.state().unwrap()),
            _ => {}
        }
    }
    let confirmation = confirmed.unwrap();
    assert_eq!(confirmation.version, 1);
    assert_eq!(confirmation.client_sequence_number, 1);
    assert_eq!(replaced.unwrap().version, 1);

    let state = bob.recv_type(MessageType::StateReplaced).await.state().unwrap();
    assert_eq!(state.version, 1);
    assert_eq!(state.element("c1").unwrap().display_name, "Person");

    let stats = server.stats().await;
    assert_eq!(stats.operations_confirmed, 1);
    assert_eq!(stats.active_connections, 2);
}

#[tokio::test]
async fn test_rejection_returns_errors() {
    let (server, addr) = start_server().await;
    let mut client = Client::join(addr, Uuid::new_v4(), "alice").await;

    client.submit(add_class("c1", "Person", 1)).await;
    client.recv_type(MessageType::OperationConfirmed).await;

    client.submit(add_class("c1", "Other", 2)).await;
    let rejection = client
        .recv_type(MessageType::OperationRejected)
        .await
        .rejection()
        .unwrap();
    assert_eq!(rejection.client_sequence_number, 2);
    assert!(rejection.errors.iter().any(|e| e.contains("c1")));

    let controller = server.registry().get(client.diagram_id).await.unwrap();
    assert_eq!(controller.version().await, 1);
    assert_eq!(server.stats().await.operations_rejected, 1);
}

#[tokio::test]
async fn test_submit_before_join_is_rejected() {
    let (_server, addr) = start_server().await;
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}")).await.unwrap();
    let mut client = Client {
        ws,
        view_id: Uuid::new_v4(),
        diagram_id: Uuid::new_v4(),
        initial: DiagramState::new(),
    };

    client.submit(add_class("c1", "Person", 7)).await;
    let rejection = client.recv().await.rejection().unwrap();
    assert_eq!(rejection.client_sequence_number, 7);
}

#[tokio::test]
async fn test_ping_pong() {
    let (_server, addr) = start_server().await;
    let mut client = Client::join(addr, Uuid::new_v4(), "alice").await;

    client.send(SyncMessage::ping(client.view_id)).await;
    let pong = client.recv_type(MessageType::Pong).await;
    assert_eq!(pong.view_id, client.view_id);
}

#[tokio::test]
async fn test_disconnect_notifies_peers_and_closes_idle_diagram() {
    let (server, addr) = start_server().await;
    let diagram = Uuid::new_v4();
    let mut alice = Client::join(addr, diagram, "alice").await;
    let mut bob = Client::join(addr, diagram, "bob").await;
    alice.recv_type(MessageType::PeerJoined).await;

    bob.ws.close(None).await.unwrap();
    let left = alice.recv_type(MessageType::PeerLeft).await;
    assert_eq!(left.peer().unwrap().user_id, "bob");

    alice.ws.close(None).await.unwrap();
    for _ in 0..100 {
        if server.registry().diagram_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.registry().diagram_count().await, 0);
}

#[tokio::test]
async fn test_shared_view_id_gets_distinct_registrations() {
    let (server, addr) = start_server().await;
    let diagram = Uuid::new_v4();
    let shared = Uuid::new_v4();
    let mut alice = Client::join_as(addr, diagram, "alice", shared).await;
    let mut mallory = Client::join_as(addr, diagram, "mallory", shared).await;
    assert_ne!(alice.view_id, mallory.view_id);

    let joined = alice.recv_type(MessageType::PeerJoined).await;
    assert_eq!(joined.peer().unwrap().view_id, mallory.view_id);

    // Closing the second connection must not take the first one's view with it.
    mallory.ws.close(None).await.unwrap();
    alice.recv_type(MessageType::PeerLeft).await;

    let controller = server.registry().get(diagram).await.unwrap();
    assert_eq!(controller.view_count().await, 1);

    alice.submit(add_class("c1", "Person", 1)).await;
    let confirmation = alice
        .recv_type(MessageType::OperationConfirmed)
        .await
        .confirmation()
        .unwrap();
    assert_eq!(confirmation.version, 1);
}
