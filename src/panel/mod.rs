//! Headless control panel for one device.

mod control_panel;
mod toggle;
mod view;

pub use control_panel::{AlwaysConfirm, Confirm, ControlPanel, DIMMER_RANGE, PanelEvent};
pub use toggle::{ToggleAction, ToggleState};
pub use view::PanelView;
