//! Connect-or-spawn lifecycle against the real server binary.
//!
//! Client A finds no server and spawns one; client B finds A's server and
//! adopts it. An adopting client never terminates the server on
//! disconnect; the spawning, non-persistent client does.

use std::time::{Duration, Instant};

use zmqruntime::client::execution::CommandHooks;
use zmqruntime::client::CommandSpawner;
use zmqruntime::transport::ping_control;
use zmqruntime::{ExecutionClient, RuntimeConfig, TransportMode};

const PORT: u16 = 7821;

fn binary_hooks() -> CommandHooks {
    CommandHooks {
        spawner: CommandSpawner {
            program: env!("CARGO_BIN_EXE_zmqruntime-server").into(),
            args: vec![
                "--transport".to_string(),
                "tcp".to_string(),
                "--host".to_string(),
                "127.0.0.1".to_string(),
            ],
        },
    }
}

fn server_answers() -> bool {
    ping_control(
        PORT,
        "127.0.0.1",
        TransportMode::Tcp,
        &RuntimeConfig::default(),
        500,
        true,
    )
}

#[test]
fn test_spawn_then_adopt_then_teardown() {
    // Client A: nothing on the port, so connect spawns the binary.
    let mut client_a = ExecutionClient::new(
        PORT,
        "127.0.0.1",
        false,
        binary_hooks(),
        Some(TransportMode::Tcp),
        None,
    );
    assert!(
        client_a.connect(Duration::from_secs(20)),
        "client A should spawn and reach a ready server"
    );
    assert!(!client_a.connected_to_existing());
    assert!(server_answers());

    // Client B: same port, existing ready pong, adopts without spawning.
    let mut client_b = ExecutionClient::new(
        PORT,
        "127.0.0.1",
        false,
        binary_hooks(),
        Some(TransportMode::Tcp),
        None,
    );
    assert!(client_b.connect(Duration::from_secs(5)));
    assert!(client_b.connected_to_existing());

    // B disconnecting (non-persistent, adopted) must leave the server up.
    client_b.disconnect();
    assert!(server_answers());

    // A disconnecting (non-persistent, spawner) terminates its child.
    client_a.disconnect();
    let deadline = Instant::now() + Duration::from_secs(5);
    while server_answers() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(100));
    }
    assert!(!server_answers(), "spawned server should be gone");
}
