/// Built-in health checks
use async_trait::async_trait;

use super::{HealthCheck, HealthStatus};
use crate::commands::Ping;
use crate::core::{Command, Connection};

/// Sends `RpbPingReq` and expects `RpbPingResp`
#[derive(Debug, Clone, Default)]
pub struct PingHealthCheck;

impl PingHealthCheck {
    pub fn new() -> Self {
        PingHealthCheck
    }
}

#[async_trait]
impl HealthCheck for PingHealthCheck {
    async fn check(&self, connection: &Connection) -> HealthStatus {
        match connection.execute(&mut Ping::new()).await {
            Ok(()) => HealthStatus::Healthy,
            Err(e) => HealthStatus::Unhealthy {
                reason: format!("ping failed: {}", e),
            },
        }
    }
}

/// Runs a fresh command from `factory` on each check
///
/// Any successful completion counts as healthy.
pub struct CommandHealthCheck<F> {
    factory: F,
}

impl<F, C> CommandHealthCheck<F>
where
    F: Fn() -> C + Send + Sync,
    C: Command,
{
    pub fn new(factory: F) -> Self {
        Self { factory }
    }
}

#[async_trait]
impl<F, C> HealthCheck for CommandHealthCheck<F>
where
    F: Fn() -> C + Send + Sync,
    C: Command,
{
    async fn check(&self, connection: &Connection) -> HealthStatus {
        let mut command = (self.factory)();
        let name = command.name();
        match connection.execute(&mut command).await {
            Ok(()) => HealthStatus::Healthy,
            Err(e) => HealthStatus::Unhealthy {
                reason: format!("{} failed: {}", name, e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::RawCommand;
    use crate::core::connection::ConnectOptions;
    use crate::test_support::{error_frame, frame, MockServer, Reply};

    #[tokio::test]
    async fn test_ping_check() {
        let server = MockServer::ping().await;
        let connection = Connection::connect(1, ConnectOptions::new(server.address.clone()))
            .await
            .unwrap();

        let status = PingHealthCheck::new().check(&connection).await;
        assert!(status.is_healthy());
        assert_eq!(server.requests(), 1);
    }

    #[tokio::test]
    async fn test_command_check_reports_server_error() {
        let server = MockServer::start(|f| {
            if f.code == 9 {
                Reply::Frames(vec![frame(10, b"ok")])
            } else {
                Reply::Frames(vec![error_frame("not allowed")])
            }
        })
        .await;
        let connection = Connection::connect(1, ConnectOptions::new(server.address.clone()))
            .await
            .unwrap();

        let good = CommandHealthCheck::new(|| RawCommand::new(9, 10, None));
        assert!(good.check(&connection).await.is_healthy());

        let bad = CommandHealthCheck::new(|| RawCommand::new(11, 12, None));
        match bad.check(&connection).await {
            HealthStatus::Unhealthy { reason } => assert!(reason.contains("not allowed")),
            other => panic!("unexpected status: {:?}", other),
        }
    }
}
