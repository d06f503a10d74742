//! Tipos compartidos entre el agente, el scheduler y el cliente.

pub mod messages;
pub mod task;
pub mod views;

pub use messages::*;
pub use task::*;
pub use views::*;
