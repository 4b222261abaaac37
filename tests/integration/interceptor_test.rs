// tests/integration/interceptor_test.rs

//! Integration tests for the built-in interceptor chain, driven through a
//! manager with a recording upstream.

use super::fixtures::*;
use super::test_helpers::*;
use jdwpmux::config::InterceptorConfig;
use jdwpmux::core::client::{AttachedClient, ClientId};
use jdwpmux::core::interceptor::{
    ClientInitializationInterceptor, InterceptContext, Interceptor, InterceptorChain,
    NoReplyInterceptor,
};
use jdwpmux::core::manager::ClientManager;
use jdwpmux::core::protocol::{ChunkType, HANDSHAKE, JdwpPacket, Unit};
use std::sync::{Arc, Mutex};

const PROF: ChunkType = ChunkType(*b"PROF");

/// Sends the client's handshake and forgets what the relay echoed back.
fn handshake(manager: &ClientManager, client: &RecordingClient) {
    manager.write(client.client_id(), HANDSHAKE);
    client.clear();
}

fn default_manager() -> (Arc<ClientManager>, Arc<RecordingUpstream>) {
    manager_with(InterceptorChain::default())
}

fn dbgs_id(client: &RecordingClient) -> Option<u32> {
    match client.units().into_iter().find(|unit| is_dbgs(unit, true))? {
        Unit::Packet(packet) => Some(packet.id()),
        _ => None,
    }
}

/// Hands an interceptor to a manager while the test keeps a handle to inspect it.
struct Shared<I>(Arc<Mutex<I>>);

impl<I: Interceptor> Interceptor for Shared<I> {
    fn name(&self) -> &'static str {
        self.0.lock().unwrap().name()
    }
    fn filter_to_device(&mut self, ctx: &InterceptContext<'_>, packet: &JdwpPacket) -> bool {
        self.0.lock().unwrap().filter_to_device(ctx, packet)
    }
    fn filter_raw_to_device(&mut self, ctx: &InterceptContext<'_>, bytes: &[u8]) -> bool {
        self.0.lock().unwrap().filter_raw_to_device(ctx, bytes)
    }
    fn observe_from_device(&mut self, packet: &JdwpPacket) {
        self.0.lock().unwrap().observe_from_device(packet)
    }
    fn filter_to_client(&mut self, ctx: &InterceptContext<'_>, packet: &JdwpPacket) -> bool {
        self.0.lock().unwrap().filter_to_client(ctx, packet)
    }
    fn filter_raw_to_client(&mut self, ctx: &InterceptContext<'_>, bytes: &[u8]) -> bool {
        self.0.lock().unwrap().filter_raw_to_client(ctx, bytes)
    }
    fn on_client_handshake(&mut self, ctx: &InterceptContext<'_>) {
        self.0.lock().unwrap().on_client_handshake(ctx)
    }
    fn on_client_detached(&mut self, client: ClientId, remaining: &[Arc<AttachedClient>]) {
        self.0.lock().unwrap().on_client_detached(client, remaining)
    }
}

fn shared_manager<I: Interceptor + 'static>(
    interceptor: I,
) -> (Arc<ClientManager>, Arc<Mutex<I>>) {
    let handle = Arc::new(Mutex::new(interceptor));
    let chain = InterceptorChain::new(vec![Box::new(Shared(Arc::clone(&handle)))]);
    let (manager, _) = manager_with(chain);
    (manager, handle)
}

#[test]
fn test_default_chain_order() {
    let chain = InterceptorChain::with_defaults(&InterceptorConfig::default());
    assert_eq!(chain.names(), vec!["no_reply", "client_init", "debugger"]);
    assert!(InterceptorChain::empty().is_empty());
}

// ===== Client initialization =====

#[tokio::test]
async fn test_handshake_is_echoed_and_not_forwarded() {
    let (manager, upstream) = default_manager();
    let clients = attach_clients(&manager, 1);

    manager.write(clients[0].client_id(), HANDSHAKE);

    assert_eq!(clients[0].received(), HANDSHAKE.to_vec());
    assert!(upstream.sent_after_handshake().is_empty());
}

#[tokio::test]
async fn test_traffic_is_gated_until_handshake() {
    let (manager, upstream) = default_manager();
    let clients = attach_clients(&manager, 1);
    let id = clients[0].client_id();

    manager.write(id, jdwp_command(1).as_bytes());
    manager.on_device_data(device_event(2).as_bytes());
    manager.on_device_data(b"\x00\x00\x00\x02not-a-packet");
    assert!(upstream.sent_after_handshake().is_empty());
    assert!(clients[0].received().is_empty());

    handshake(&manager, &clients[0]);
    manager.write(id, jdwp_command(3).as_bytes());
    manager.on_device_data(device_event(4).as_bytes());
    assert_eq!(upstream.sent_after_handshake(), jdwp_command(3).as_bytes());
    assert_eq!(clients[0].received(), device_event(4).as_bytes());
}

#[tokio::test]
async fn test_handshake_in_same_write_as_first_command() {
    let (manager, upstream) = default_manager();
    let clients = attach_clients(&manager, 1);
    let mut data = HANDSHAKE.to_vec();
    data.extend_from_slice(jdwp_command(1).as_bytes());

    manager.write(clients[0].client_id(), &data);

    assert_eq!(upstream.sent_after_handshake(), jdwp_command(1).as_bytes());
    assert_eq!(clients[0].received(), HANDSHAKE.to_vec());
}

#[tokio::test]
async fn test_cached_reply_answers_second_client_with_its_own_id() {
    let (manager, upstream) = default_manager();
    let clients = attach_clients(&manager, 2);
    let (a, b) = (&clients[0], &clients[1]);
    handshake(&manager, a);
    handshake(&manager, b);

    manager.write(a.client_id(), ddm(5, ChunkType::HELO, &[0, 0, 0, 1]).as_bytes());
    assert_eq!(
        upstream.sent_after_handshake(),
        ddm(5, ChunkType::HELO, &[0, 0, 0, 1]).as_bytes()
    );

    let answer = ddm_reply(5, ChunkType::HELO, b"vm-info");
    manager.on_device_data(answer.as_bytes());
    assert_eq!(a.received(), answer.as_bytes());
    assert!(b.received().is_empty(), "a reply must reach only its requester");

    manager.write(b.client_id(), ddm(9, ChunkType::HELO, &[0, 0, 0, 1]).as_bytes());
    assert_eq!(upstream.sent().len(), 2, "cached requests are not forwarded");
    assert_eq!(b.received(), answer.with_id(9).as_bytes());
}

#[tokio::test]
async fn test_error_replies_are_not_cached() {
    let (manager, upstream) = default_manager();
    let clients = attach_clients(&manager, 1);
    let id = clients[0].client_id();
    handshake(&manager, &clients[0]);

    manager.write(id, ddm(5, ChunkType::FEAT, &[]).as_bytes());
    manager.on_device_data(JdwpPacket::reply(5, 41, &[]).as_bytes());
    manager.write(id, ddm(6, ChunkType::FEAT, &[]).as_bytes());

    assert_eq!(upstream.sent().len(), 3);
}

#[tokio::test]
async fn test_announcements_are_replayed_after_handshake() {
    let (manager, _) = default_manager();
    let clients = attach_clients(&manager, 1);
    let appname = ddm(100, ChunkType::APNM, b"com.example.app");
    manager.on_device_data(appname.as_bytes());
    assert!(clients[0].received().is_empty());

    manager.write(clients[0].client_id(), HANDSHAKE);

    assert_eq!(
        clients[0].units(),
        vec![Unit::Handshake, Unit::Packet(appname)]
    );
}

#[tokio::test]
async fn test_newer_announcement_replaces_older_one() {
    let (manager, _) = default_manager();
    let clients = attach_clients(&manager, 1);
    manager.on_device_data(ddm(100, ChunkType::APNM, b"<pre-initialized>").as_bytes());
    let latest = ddm(101, ChunkType::APNM, b"com.example.app");
    manager.on_device_data(latest.as_bytes());

    manager.write(clients[0].client_id(), HANDSHAKE);

    assert_eq!(clients[0].units(), vec![Unit::Handshake, Unit::Packet(latest)]);
}

#[tokio::test]
async fn test_announcement_with_no_clients_reaches_the_next_client() {
    let (manager, _) = default_manager();
    let appname = ddm(100, ChunkType::APNM, b"com.example.app");
    manager.on_device_data(appname.as_bytes());

    let clients = attach_clients(&manager, 1);
    manager.write(clients[0].client_id(), HANDSHAKE);

    assert_eq!(
        clients[0].units(),
        vec![Unit::Handshake, Unit::Packet(appname)]
    );
}

#[tokio::test]
async fn test_announcement_while_idle_replaces_the_stale_one() {
    let (manager, _) = default_manager();
    let first = attach_clients(&manager, 1);
    manager.on_device_data(ddm(100, ChunkType::APNM, b"<pre-initialized>").as_bytes());
    manager.remove_client(first[0].client_id());
    assert_eq!(manager.client_count(), 0);

    let renamed = ddm(101, ChunkType::APNM, b"com.example.app");
    manager.on_device_data(renamed.as_bytes());
    let late = attach_clients(&manager, 1);
    manager.write(late[0].client_id(), HANDSHAKE);

    assert_eq!(late[0].units(), vec![Unit::Handshake, Unit::Packet(renamed)]);
}

#[tokio::test]
async fn test_raw_bytes_pass_after_handshake() {
    let (manager, upstream) = default_manager();
    let clients = attach_clients(&manager, 2);
    handshake(&manager, &clients[0]);
    let garbage = b"\x00\x00\x00\x03raw-bytes-from-somewhere";

    manager.write(clients[0].client_id(), garbage);
    manager.on_device_data(garbage);

    assert_eq!(upstream.sent_after_handshake(), garbage.to_vec());
    assert_eq!(clients[0].received(), garbage.to_vec());
    assert!(clients[1].received().is_empty());
}

// ===== No-reply =====

#[tokio::test]
async fn test_no_reply_command_answer_is_dropped() {
    let (manager, upstream) = default_manager();
    let clients = attach_clients(&manager, 2);
    handshake(&manager, &clients[0]);
    handshake(&manager, &clients[1]);
    let exit = ddm(7, ChunkType::EXIT, &[0, 0, 0, 1]);

    manager.write(clients[0].client_id(), exit.as_bytes());
    assert_eq!(upstream.sent_after_handshake(), exit.as_bytes());

    manager.on_device_data(reply(7).as_bytes());
    assert!(clients[0].received().is_empty());
    assert!(clients[1].received().is_empty());
}

#[tokio::test]
async fn test_custom_no_reply_chunks() {
    let config = InterceptorConfig {
        no_reply_chunks: vec![PROF],
        ..InterceptorConfig::default()
    };
    let (manager, _) = manager_with(InterceptorChain::with_defaults(&config));
    let clients = attach_clients(&manager, 1);
    handshake(&manager, &clients[0]);

    manager.write(clients[0].client_id(), ddm(3, PROF, &[]).as_bytes());
    manager.on_device_data(reply(3).as_bytes());
    manager.write(clients[0].client_id(), ddm(4, ChunkType::EXIT, &[]).as_bytes());
    manager.on_device_data(reply(4).as_bytes());

    assert_eq!(clients[0].received(), reply(4).as_bytes());
}

// ===== Debugger arbitration =====

#[tokio::test]
async fn test_first_jdwp_command_takes_ownership() {
    let (manager, upstream) = default_manager();
    let clients = attach_clients(&manager, 2);
    let (a, b) = (&clients[0], &clients[1]);
    handshake(&manager, a);
    handshake(&manager, b);

    manager.write(a.client_id(), jdwp_command(1).as_bytes());
    assert_eq!(upstream.sent_after_handshake(), jdwp_command(1).as_bytes());
    assert!(a.received().is_empty());
    assert_eq!(b.units().len(), 1);
    assert!(is_dbgs(&b.units()[0], true));

    // The non-owner is locked out of non-DDM traffic.
    manager.write(b.client_id(), jdwp_command(2).as_bytes());
    assert_eq!(upstream.sent().len(), 2);

    // DDM traffic still flows for everyone.
    let prof = ddm(3, PROF, &[]);
    manager.write(b.client_id(), prof.as_bytes());
    assert_eq!(upstream.sent().len(), 3);
}

#[tokio::test]
async fn test_device_traffic_routing_while_owned() {
    let (manager, _) = default_manager();
    let clients = attach_clients(&manager, 2);
    let (a, b) = (&clients[0], &clients[1]);
    handshake(&manager, a);
    handshake(&manager, b);
    manager.write(a.client_id(), jdwp_command(1).as_bytes());
    b.clear();

    manager.on_device_data(reply(1).as_bytes());
    manager.on_device_data(device_event(50).as_bytes());
    let announcement = ddm(51, ChunkType::WAIT, &[0]);
    manager.on_device_data(announcement.as_bytes());

    assert_eq!(
        a.units(),
        vec![
            Unit::Packet(reply(1)),
            Unit::Packet(device_event(50)),
            Unit::Packet(announcement.clone())
        ]
    );
    assert_eq!(b.units(), vec![Unit::Packet(announcement)]);
}

#[tokio::test]
async fn test_owner_detach_releases_session() {
    let (manager, upstream) = default_manager();
    let clients = attach_clients(&manager, 2);
    let (a, b) = (&clients[0], &clients[1]);
    handshake(&manager, a);
    handshake(&manager, b);
    manager.write(a.client_id(), jdwp_command(1).as_bytes());
    b.clear();

    manager.remove_client(a.client_id());
    assert_eq!(b.units().len(), 1);
    assert!(is_dbgs(&b.units()[0], false));

    manager.write(b.client_id(), jdwp_command(2).as_bytes());
    let last = upstream.sent().last().map(|bytes| bytes.to_vec());
    assert_eq!(last, Some(jdwp_command(2).as_bytes().to_vec()));
}

#[tokio::test]
async fn test_late_client_learns_about_existing_owner() {
    let (manager, _) = default_manager();
    let owner = attach_clients(&manager, 1);
    handshake(&manager, &owner[0]);
    manager.write(owner[0].client_id(), jdwp_command(1).as_bytes());

    let late = attach_clients(&manager, 1);
    manager.write(late[0].client_id(), HANDSHAKE);

    let units = late[0].units();
    assert_eq!(units.len(), 2);
    assert_eq!(units[0], Unit::Handshake);
    assert!(is_dbgs(&units[1], true));
}

#[tokio::test]
async fn test_replies_to_status_packets_are_swallowed() {
    let (manager, upstream) = default_manager();
    let clients = attach_clients(&manager, 2);
    let (a, b) = (&clients[0], &clients[1]);
    handshake(&manager, a);
    handshake(&manager, b);
    manager.write(a.client_id(), jdwp_command(1).as_bytes());

    let status_id = dbgs_id(b).expect("b should have been told about the owner");
    manager.write(b.client_id(), JdwpPacket::reply(status_id, 0, &[]).as_bytes());

    assert_eq!(upstream.sent().len(), 2);
}

#[tokio::test]
async fn test_reply_reaches_only_requester_when_ids_do_not_collide() {
    let (manager, _) = default_manager();
    let clients = attach_clients(&manager, 3);
    for client in &clients {
        handshake(&manager, client);
    }

    manager.write(clients[2].client_id(), ddm(12, PROF, &[]).as_bytes());
    manager.on_device_data(ddm_reply(12, PROF, b"data").as_bytes());

    assert!(clients[0].received().is_empty());
    assert!(clients[1].received().is_empty());
    assert_eq!(clients[2].received(), ddm_reply(12, PROF, b"data").as_bytes());
}

#[tokio::test]
async fn test_reply_with_unknown_id_reaches_everyone() {
    let (manager, _) = default_manager();
    let clients = attach_clients(&manager, 2);
    handshake(&manager, &clients[0]);
    handshake(&manager, &clients[1]);

    manager.on_device_data(reply(77).as_bytes());

    assert!(clients.iter().all(|c| c.received() == reply(77).as_bytes()));
}

#[tokio::test]
async fn test_reused_reply_id_nobody_asked_for_reaches_everyone() {
    let (manager, _) = default_manager();
    let clients = attach_clients(&manager, 2);
    handshake(&manager, &clients[0]);
    handshake(&manager, &clients[1]);

    manager.write(clients[0].client_id(), ddm(12, PROF, &[]).as_bytes());
    let answer = ddm_reply(12, PROF, b"data");
    manager.on_device_data(answer.as_bytes());
    assert!(clients[1].received().is_empty());

    manager.on_device_data(reply(12).as_bytes());

    let mut expected = answer.as_bytes().to_vec();
    expected.extend_from_slice(reply(12).as_bytes());
    assert_eq!(clients[0].received(), expected);
    assert_eq!(clients[1].received(), reply(12).as_bytes());
}

// ===== Per-client state =====

#[tokio::test]
async fn test_no_reply_state_is_dropped_on_detach() {
    let (manager, no_reply) = shared_manager(NoReplyInterceptor::new([ChunkType::EXIT]));
    let clients = attach_clients(&manager, 2);
    let (a, b) = (clients[0].client_id(), clients[1].client_id());

    manager.write(a, ddm(4, ChunkType::EXIT, &[0, 0, 0, 1]).as_bytes());
    manager.write(b, ddm(5, ChunkType::EXIT, &[0, 0, 0, 1]).as_bytes());
    assert_eq!(no_reply.lock().unwrap().pending_for(a), 1);

    manager.remove_client(a);

    assert_eq!(no_reply.lock().unwrap().pending_for(a), 0);
    assert_eq!(no_reply.lock().unwrap().pending_for(b), 1);
}

#[tokio::test]
async fn test_client_init_state_is_dropped_on_detach() {
    let (manager, init) = shared_manager(ClientInitializationInterceptor::new(
        [ChunkType::HELO],
        [ChunkType::APNM],
    ));
    let clients = attach_clients(&manager, 2);
    let (a, b) = (clients[0].client_id(), clients[1].client_id());
    manager.write(a, HANDSHAKE);
    manager.write(b, HANDSHAKE);
    assert_eq!(init.lock().unwrap().tracked_clients(), 2);
    assert!(init.lock().unwrap().is_initialized(a));

    manager.remove_client(a);

    let init = init.lock().unwrap();
    assert_eq!(init.tracked_clients(), 1);
    assert!(!init.is_initialized(a));
    assert!(init.is_initialized(b));
}
