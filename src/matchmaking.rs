use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::models::{Color, ServerEvent, WriteTask};
use crate::queue::{matchmaking_queue_name, SharedQueue, TIME_CONTROLS};
use crate::registry::{ConnectionHandle, ConnectionRegistry};

const SWEEP_INTERVAL: Duration = Duration::from_secs(2);

/// Spawns the periodic sweep over all matchmaking buckets.
pub fn start(
    queue: SharedQueue,
    connections: ConnectionRegistry,
    write_tx: mpsc::UnboundedSender<WriteTask>,
) {
    info!("Starting matchmaking sweep");
    actix_web::rt::spawn(async move {
        loop {
            for tc in TIME_CONTROLS {
                if let Err(err) = sweep_bucket(tc, &queue, &connections, &write_tx).await {
                    warn!("matchmaking sweep failed for {}s bucket: {}", tc, err);
                }
            }
            tokio::time::sleep(SWEEP_INTERVAL).await;
        }
    });
}

/// Puts an identity into the bucket for the requested time control. An
/// identity waits in at most one bucket, so any previous entry is purged
/// first.
pub async fn enter_queue(
    queue: &SharedQueue,
    time_control: u32,
    user_id: &str,
) -> Result<(), QueueError> {
    purge(queue, user_id).await?;
    queue
        .push_back(&matchmaking_queue_name(time_control), user_id)
        .await
}

/// Removes an identity from every bucket it may occupy.
pub async fn purge(queue: &SharedQueue, user_id: &str) -> Result<(), QueueError> {
    for tc in TIME_CONTROLS {
        let removed = queue.remove(&matchmaking_queue_name(tc), user_id).await?;
        if removed > 0 {
            info!("Removed user {} from {}s matchmaking queue", user_id, tc);
        }
    }
    Ok(())
}

/// One sweep of one bucket: pop a pair, originate a session if both are
/// still connected, otherwise restore the live one to the front of the
/// bucket so it keeps its queue position.
pub async fn sweep_bucket(
    time_control: u32,
    queue: &SharedQueue,
    connections: &ConnectionRegistry,
    write_tx: &mpsc::UnboundedSender<WriteTask>,
) -> Result<(), QueueError> {
    let bucket = matchmaking_queue_name(time_control);
    if queue.len(&bucket).await? < 2 {
        return Ok(());
    }

    let first = queue.pop_front(&bucket).await?;
    let second = queue.pop_front(&bucket).await?;

    match (first, second) {
        (Some(a), Some(b)) => {
            if a == b {
                // Duplicate entry; keep one waiting.
                queue.push_front(&bucket, &a).await?;
                return Ok(());
            }
            match (connections.lookup(&a), connections.lookup(&b)) {
                (Some(conn_a), Some(conn_b)) => {
                    pair(time_control, conn_a, conn_b, write_tx);
                }
                (Some(_), None) => {
                    info!("Matchmaking: {} disconnected, requeueing {}", b, a);
                    queue.push_front(&bucket, &a).await?;
                }
                (None, Some(_)) => {
                    info!("Matchmaking: {} disconnected, requeueing {}", a, b);
                    queue.push_front(&bucket, &b).await?;
                }
                (None, None) => {}
            }
        }
        (Some(a), None) => {
            queue.push_front(&bucket, &a).await?;
        }
        _ => {}
    }

    Ok(())
}

/// Originates a matched session: coin-flip colors, enqueue the durable
/// create, and notify both players directly.
fn pair(
    time_control: u32,
    conn_a: ConnectionHandle,
    conn_b: ConnectionHandle,
    write_tx: &mpsc::UnboundedSender<WriteTask>,
) {
    let game_id = Uuid::new_v4();
    let initial_time_ms = time_control as i64 * 1000;
    let (white, black) = if rand::random::<bool>() {
        (conn_a, conn_b)
    } else {
        (conn_b, conn_a)
    };

    info!(
        "Matchmaking: paired {} (w) vs {} (b) at {}s, game {}",
        white.identity.id, black.identity.id, time_control, game_id
    );

    if write_tx
        .send(WriteTask::CreateMatchedGame {
            game_id,
            white_player_id: white.identity.id.clone(),
            black_player_id: black.identity.id.clone(),
            time_control,
            initial_time_ms,
        })
        .is_err()
    {
        warn!("write queue receiver dropped; matched game {} lost", game_id);
    }

    white.send(ServerEvent::MatchFound {
        game_id,
        opponent_name: black.identity.name.clone(),
        color: Color::White,
    });
    black.send(ServerEvent::MatchFound {
        game_id,
        opponent_name: white.identity.name.clone(),
        color: Color::Black,
    });
}
