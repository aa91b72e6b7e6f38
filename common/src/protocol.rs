use crate::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    NotLoggedIn,
    LoggedIn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientCall {
    Login,
    Logout,
    Compute,
    SetComputation,
    GetResult,
    IsComplete,
}

/// Contador de cómputos pendientes asociado a la llamada.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Keep,
    Push,
    Pop,
    Reset,
}

// (llamada, estado requerido, estado siguiente, efecto en pendientes)
const TABLE: [(ClientCall, ClientState, ClientState, Pending); 6] = [
    (
        ClientCall::Login,
        ClientState::NotLoggedIn,
        ClientState::LoggedIn,
        Pending::Reset,
    ),
    (
        ClientCall::Logout,
        ClientState::LoggedIn,
        ClientState::NotLoggedIn,
        Pending::Reset,
    ),
    (
        ClientCall::Compute,
        ClientState::LoggedIn,
        ClientState::LoggedIn,
        Pending::Keep,
    ),
    (
        ClientCall::SetComputation,
        ClientState::LoggedIn,
        ClientState::LoggedIn,
        Pending::Push,
    ),
    (
        ClientCall::GetResult,
        ClientState::LoggedIn,
        ClientState::LoggedIn,
        Pending::Pop,
    ),
    (
        ClientCall::IsComplete,
        ClientState::LoggedIn,
        ClientState::LoggedIn,
        Pending::Keep,
    ),
];

/// Valida la secuencia de llamadas de un cliente.
#[derive(Debug, Clone)]
pub struct ProtocolChecker {
    state: ClientState,
    pending: usize,
}

impl ProtocolChecker {
    pub fn new() -> Self {
        Self {
            state: ClientState::NotLoggedIn,
            pending: 0,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Aplica la transición o devuelve el error sin tocar el estado.
    pub fn check(&mut self, call: ClientCall) -> Result<(), ProtocolError> {
        let (_, required, next, effect) = TABLE
            .iter()
            .copied()
            .find(|(c, ..)| *c == call)
            .ok_or(ProtocolError::NotLoggedIn)?;

        if self.state != required {
            return Err(match required {
                ClientState::LoggedIn => ProtocolError::NotLoggedIn,
                ClientState::NotLoggedIn => ProtocolError::AlreadyLoggedIn,
            });
        }

        match effect {
            Pending::Pop if self.pending == 0 => {
                return Err(ProtocolError::NoComputationRequested);
            }
            Pending::Pop => self.pending -= 1,
            Pending::Push => self.pending += 1,
            Pending::Reset => self.pending = 0,
            Pending::Keep => {}
        }
        self.state = next;
        Ok(())
    }

    /// Cierre forzado (la sesión terminó por una falla del cómputo).
    pub fn force_logout(&mut self) {
        self.state = ClientState::NotLoggedIn;
        self.pending = 0;
    }
}

impl Default for ProtocolChecker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secuencia_valida() {
        let mut p = ProtocolChecker::new();
        p.check(ClientCall::Login).unwrap();
        p.check(ClientCall::SetComputation).unwrap();
        p.check(ClientCall::SetComputation).unwrap();
        p.check(ClientCall::IsComplete).unwrap();
        p.check(ClientCall::GetResult).unwrap();
        p.check(ClientCall::GetResult).unwrap();
        p.check(ClientCall::Compute).unwrap();
        p.check(ClientCall::Logout).unwrap();
        assert_eq!(p.state(), ClientState::NotLoggedIn);
    }

    #[test]
    fn doble_login_es_error() {
        let mut p = ProtocolChecker::new();
        p.check(ClientCall::Login).unwrap();
        assert_eq!(
            p.check(ClientCall::Login),
            Err(ProtocolError::AlreadyLoggedIn)
        );
        assert_eq!(p.state(), ClientState::LoggedIn);
    }

    #[test]
    fn llamadas_sin_login_son_error() {
        let mut p = ProtocolChecker::new();
        for call in [
            ClientCall::Logout,
            ClientCall::Compute,
            ClientCall::SetComputation,
            ClientCall::GetResult,
            ClientCall::IsComplete,
        ] {
            assert_eq!(p.check(call), Err(ProtocolError::NotLoggedIn));
        }
    }

    #[test]
    fn get_result_sin_computo_pendiente() {
        let mut p = ProtocolChecker::new();
        p.check(ClientCall::Login).unwrap();
        assert_eq!(
            p.check(ClientCall::GetResult),
            Err(ProtocolError::NoComputationRequested)
        );
        p.check(ClientCall::SetComputation).unwrap();
        p.check(ClientCall::GetResult).unwrap();
        assert_eq!(
            p.check(ClientCall::GetResult),
            Err(ProtocolError::NoComputationRequested)
        );
    }

    #[test]
    fn logout_reinicia_pendientes() {
        let mut p = ProtocolChecker::new();
        p.check(ClientCall::Login).unwrap();
        p.check(ClientCall::SetComputation).unwrap();
        p.check(ClientCall::Logout).unwrap();
        p.check(ClientCall::Login).unwrap();
        assert_eq!(p.pending(), 0);
    }
}
