//! One exposed domain and the resources it owns

use crate::error::TunnelError;
use crate::manager::TunnelSummary;
use dotlocal_cert::Certificate;
use dotlocal_proxy::ProxyServer;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl TunnelState {
    fn can_transition_to(self, next: TunnelState) -> bool {
        use TunnelState::*;
        matches!(
            (self, next),
            (Created, Starting)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Running, Stopping)
                | (Stopping, Stopped)
        )
    }
}

/// A tunnel from `domain` to a local backend port
pub struct Tunnel {
    domain: String,
    backend_port: u16,
    http_port: u16,
    https_port: u16,
    use_https: bool,
    certificate: Option<Certificate>,
    listener: Option<Arc<ProxyServer>>,
    discovery_port: Option<u16>,
    state: TunnelState,
    done_tx: watch::Sender<bool>,
}

impl Tunnel {
    pub fn new(
        domain: String,
        backend_port: u16,
        use_https: bool,
        http_port: u16,
        https_port: u16,
    ) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            domain,
            backend_port,
            http_port,
            https_port,
            use_https,
            certificate: None,
            listener: None,
            discovery_port: None,
            state: TunnelState::Created,
            done_tx,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn backend_port(&self) -> u16 {
        self.backend_port
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn https_port(&self) -> u16 {
        self.https_port
    }

    pub fn use_https(&self) -> bool {
        self.use_https
    }

    /// Port inbound traffic is accepted on for this tunnel's scheme
    pub fn listen_port(&self) -> u16 {
        if self.use_https {
            self.https_port
        } else {
            self.http_port
        }
    }

    pub fn certificate(&self) -> Option<&Certificate> {
        self.certificate.as_ref()
    }

    pub fn set_certificate(&mut self, certificate: Certificate) {
        self.certificate = Some(certificate);
    }

    /// Dedicated listener, if this tunnel owns one
    pub fn listener(&self) -> Option<&Arc<ProxyServer>> {
        self.listener.as_ref()
    }

    pub fn set_listener(&mut self, listener: Arc<ProxyServer>) {
        self.listener = Some(listener);
    }

    pub(crate) fn take_listener(&mut self) -> Option<Arc<ProxyServer>> {
        self.listener.take()
    }

    /// Port the domain was advertised on
    pub fn discovery_port(&self) -> Option<u16> {
        self.discovery_port
    }

    pub fn set_discovery_port(&mut self, port: u16) {
        self.discovery_port = Some(port);
    }

    pub fn state(&self) -> TunnelState {
        self.state
    }

    pub fn transition(&mut self, next: TunnelState) -> Result<(), TunnelError> {
        if !self.state.can_transition_to(next) {
            return Err(TunnelError::InvalidState {
                domain: self.domain.clone(),
                from: self.state,
                to: next,
            });
        }
        if next == TunnelState::Running && self.use_https && self.certificate.is_none() {
            return Err(TunnelError::InvalidState {
                domain: self.domain.clone(),
                from: self.state,
                to: next,
            });
        }

        self.state = next;
        Ok(())
    }

    /// Signal cleanup observers; only the first call has an effect
    pub fn mark_done(&self) -> bool {
        self.done_tx.send_if_modified(|done| {
            if *done {
                false
            } else {
                *done = true;
                true
            }
        })
    }

    pub fn done(&self) -> DoneSignal {
        DoneSignal {
            rx: self.done_tx.subscribe(),
        }
    }

    pub fn summary(&self) -> TunnelSummary {
        TunnelSummary {
            domain: self.domain.clone(),
            backend_port: self.backend_port,
            use_https: self.use_https,
        }
    }
}

/// Observer side of a tunnel's one-shot completion flag
#[derive(Clone)]
pub struct DoneSignal {
    rx: watch::Receiver<bool>,
}

impl DoneSignal {
    pub fn is_done(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once the tunnel has been fully torn down
    pub async fn wait(mut self) {
        // An error means the tunnel was dropped, which is just as final
        let _ = self.rx.wait_for(|done| *done).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tunnel(use_https: bool) -> Tunnel {
        Tunnel::new("app.local".to_string(), 3000, use_https, 8080, 8443)
    }

    #[test]
    fn test_lifecycle() {
        let mut t = tunnel(false);
        assert_eq!(t.state(), TunnelState::Created);

        t.transition(TunnelState::Starting).unwrap();
        t.transition(TunnelState::Running).unwrap();
        t.transition(TunnelState::Stopping).unwrap();
        t.transition(TunnelState::Stopped).unwrap();

        assert!(t.transition(TunnelState::Running).is_err());
    }

    #[test]
    fn test_cannot_skip_states() {
        let mut t = tunnel(false);
        assert!(matches!(
            t.transition(TunnelState::Running),
            Err(TunnelError::InvalidState {
                from: TunnelState::Created,
                to: TunnelState::Running,
                ..
            })
        ));
    }

    #[test]
    fn test_https_requires_certificate() {
        let mut t = tunnel(true);
        t.transition(TunnelState::Starting).unwrap();
        assert!(t.transition(TunnelState::Running).is_err());
        assert_eq!(t.state(), TunnelState::Starting);

        // A failed start may still be abandoned
        t.transition(TunnelState::Stopped).unwrap();
    }

    #[test]
    fn test_listen_port_follows_scheme() {
        assert_eq!(tunnel(false).listen_port(), 8080);
        assert_eq!(tunnel(true).listen_port(), 8443);
    }

    #[tokio::test]
    async fn test_done_is_set_once() {
        let t = tunnel(false);
        let signal = t.done();
        assert!(!signal.is_done());

        let waiter = tokio::spawn(signal.clone().wait());

        assert!(t.mark_done());
        assert!(!t.mark_done());
        assert!(signal.is_done());

        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_summary() {
        let summary = tunnel(true).summary();
        assert_eq!(summary.domain, "app.local");
        assert_eq!(summary.backend_port, 3000);
        assert!(summary.use_https);
    }
}
