use librelay::EventRouter;
use relay_client::{ConnectionState, RelayClient, SubscribeOptions, Subscription};
use relay_protocol::{Channel, ErrorInfo, LifecycleEvent, SessionId, paths};

/// Start the server daemon.
pub async fn server_start(foreground: bool) -> anyhow::Result<()> {
    if foreground {
        let status = tokio::process::Command::new("relay-server")
            .status()
            .await?;
        std::process::exit(status.code().unwrap_or(1));
    } else {
        let child = std::process::Command::new("relay-server")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .stdin(std::process::Stdio::null())
            .spawn()?;

        println!("relay server started (pid: {})", child.id());
        Ok(())
    }
}

/// Stop the server daemon.
pub async fn server_stop() -> anyhow::Result<()> {
    let pid_path = paths::pid_file_path();
    if pid_path.exists() {
        let pid_str = std::fs::read_to_string(&pid_path)?;
        let pid: i32 = pid_str.trim().parse()?;
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
        let _ = std::fs::remove_file(&pid_path);
        println!("relay server stopped (pid: {pid})");
    } else {
        println!("relay server is not running");
    }
    Ok(())
}

/// Check server status.
pub async fn server_status() -> anyhow::Result<()> {
    let pid_path = paths::pid_file_path();
    if pid_path.exists() {
        let pid_str = std::fs::read_to_string(&pid_path)?;
        let pid: i32 = pid_str.trim().parse()?;
        let alive = unsafe { libc::kill(pid, 0) } == 0;
        if alive {
            println!("relay server is running (pid: {pid})");
        } else {
            println!("relay server is not running (stale pid file)");
            let _ = std::fs::remove_file(&pid_path);
        }
    } else {
        println!("relay server is not running");
    }
    Ok(())
}

async fn connect() -> anyhow::Result<RelayClient> {
    Ok(RelayClient::connect(&paths::default_socket_path()).await?)
}

pub async fn session_create(id: Option<SessionId>, max_participants: usize) -> anyhow::Result<()> {
    let mut client = connect().await?;
    let id = client.create_session(id, max_participants).await?;
    println!("{id}");
    Ok(())
}

pub async fn session_list() -> anyhow::Result<()> {
    let mut client = connect().await?;
    let sessions = client.session_list().await?;
    if sessions.is_empty() {
        println!("no sessions");
        return Ok(());
    }
    println!(
        "{:<36}  {:<12}  {:<12}  HEAD",
        "ID", "STATE", "PARTICIPANTS"
    );
    for s in &sessions {
        let head = s
            .head_offset
            .map(|o| o.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<36}  {:<12}  {:<12}  {}",
            s.id,
            format!("{:?}", s.state).to_lowercase(),
            format!("{}/{}", s.participants.len(), s.max_participants),
            head,
        );
    }
    Ok(())
}

pub async fn session_info(session_id: String) -> anyhow::Result<()> {
    let mut client = connect().await?;
    let info = client.session_info(&session_id).await?;
    println!("ID:            {}", info.id);
    println!("State:         {:?}", info.state);
    println!(
        "Participants:  {} (max {})",
        if info.participants.is_empty() {
            "-".to_string()
        } else {
            info.participants.join(", ")
        },
        info.max_participants,
    );
    println!("Created:       {} ms", info.created_at_epoch_ms);
    println!("Last activity: {} ms", info.last_activity_epoch_ms);
    println!(
        "Head offset:   {}",
        info.head_offset
            .map(|o| o.to_string())
            .unwrap_or_else(|| "-".to_string())
    );
    if let Some(error) = &info.error {
        println!("Error:         {}", error.message);
    }
    Ok(())
}

pub async fn session_send(
    session_id: String,
    event: &str,
    message: Option<String>,
) -> anyhow::Result<()> {
    let event = parse_event(event, message)?;
    let mut client = connect().await?;
    let info = client.session_send(&session_id, event).await?;
    println!("{:?}", info.state);
    Ok(())
}

pub async fn session_join(session_id: String, participant: String) -> anyhow::Result<()> {
    let mut client = connect().await?;
    let info = client
        .session_send(&session_id, LifecycleEvent::Join { participant })
        .await?;
    println!("{}", info.participants.join(", "));
    Ok(())
}

pub async fn session_leave(session_id: String, participant: String) -> anyhow::Result<()> {
    let mut client = connect().await?;
    let info = client
        .session_send(&session_id, LifecycleEvent::Leave { participant })
        .await?;
    println!(
        "{}",
        if info.participants.is_empty() {
            "-".to_string()
        } else {
            info.participants.join(", ")
        }
    );
    Ok(())
}

pub async fn session_publish(
    session_id: String,
    channel: &str,
    data: &str,
) -> anyhow::Result<()> {
    let channel = parse_channel(channel)?;
    let data: serde_json::Value = serde_json::from_str(data)?;
    let mut client = connect().await?;
    let offset = client.publish(&session_id, channel, data).await?;
    println!("{offset}");
    Ok(())
}

/// Tail the session log as JSON lines. Reconnects with backoff and resumes
/// after the last printed offset; ends when the session closes.
pub async fn session_watch(session_id: String, from: Option<u64>) -> anyhow::Result<()> {
    let mut router = EventRouter::new();
    for channel in Channel::ALL {
        router.on(channel, |entry| {
            println!("{}", serde_json::to_string(entry)?);
            Ok(())
        });
    }

    let subscription = Subscription::spawn(
        paths::default_socket_path(),
        session_id,
        SubscribeOptions {
            from_offset: from,
            ..Default::default()
        },
        router,
    );

    let mut states = subscription.state_watch();
    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            if *states.borrow() == ConnectionState::Reconnecting {
                eprintln!("[reconnecting...]");
            }
        }
    });

    subscription.join().await?;
    Ok(())
}

fn parse_event(name: &str, message: Option<String>) -> anyhow::Result<LifecycleEvent> {
    Ok(match name {
        "init" | "initialize" => LifecycleEvent::Initialize,
        "ready" => LifecycleEvent::Ready,
        "heartbeat" => LifecycleEvent::Heartbeat,
        "pause" => LifecycleEvent::Pause,
        "resume" => LifecycleEvent::Resume,
        "timeout" => LifecycleEvent::Timeout,
        "close" => LifecycleEvent::Close,
        "error" => LifecycleEvent::Error {
            error: ErrorInfo {
                message: message.unwrap_or_else(|| "error".to_string()),
                detail: None,
            },
        },
        other => anyhow::bail!(
            "unknown lifecycle event '{other}' (expected init, ready, heartbeat, pause, resume, timeout, close, or error)"
        ),
    })
}

fn parse_channel(name: &str) -> anyhow::Result<Channel> {
    serde_json::from_value(serde_json::Value::String(name.to_string()))
        .map_err(|_| anyhow::anyhow!("unknown channel '{name}'"))
}
