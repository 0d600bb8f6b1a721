use tokio_util::sync::CancellationToken;

/// Holds the cancellation token of the turn currently running in one
/// conversation. Tokens are children of the process shutdown token, so a
/// shutdown reaches every in-flight turn.
#[derive(Debug)]
pub struct InterruptController {
    parent: CancellationToken,
    current_token: Option<CancellationToken>,
}

impl InterruptController {
    pub fn new(parent: CancellationToken) -> Self {
        Self { parent, current_token: None }
    }

    /// Issue a token for a new turn attempt. Cancels any token still held.
    pub fn arm(&mut self) -> CancellationToken {
        if let Some(old) = self.current_token.take() {
            old.cancel();
        }
        let token = self.parent.child_token();
        self.current_token = Some(token.clone());
        token
    }

    /// Cancel the running attempt. The token stays in place until the
    /// attempt reports back and [`disarm`](Self::disarm) is called.
    pub fn interrupt(&self) -> bool {
        match &self.current_token {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn disarm(&mut self) {
        self.current_token = None;
    }

    pub fn is_armed(&self) -> bool {
        self.current_token.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arm_cancels_previous_token() {
        let mut ctrl = InterruptController::new(CancellationToken::new());
        let t1 = ctrl.arm();
        assert!(!t1.is_cancelled());

        let _t2 = ctrl.arm();
        assert!(t1.is_cancelled());
    }

    #[test]
    fn interrupt_keeps_token_until_disarmed() {
        let mut ctrl = InterruptController::new(CancellationToken::new());
        assert!(!ctrl.interrupt());

        let t = ctrl.arm();
        assert!(ctrl.interrupt());
        assert!(t.is_cancelled());
        assert!(ctrl.is_armed());

        ctrl.disarm();
        assert!(!ctrl.is_armed());
    }

    #[test]
    fn shutdown_reaches_armed_token() {
        let shutdown = CancellationToken::new();
        let mut ctrl = InterruptController::new(shutdown.clone());
        let t = ctrl.arm();
        shutdown.cancel();
        assert!(t.is_cancelled());
    }
}
