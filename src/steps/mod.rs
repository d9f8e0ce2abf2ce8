//! Generic steps usable from any workflow description.
//!
//! Site-specific steps implement [`Step`](crate::Step) themselves; these
//! cover the common shapes: open a page, log in through a form, collect
//! links, extract records by sequence matching, and extract in parallel
//! across many links.

mod extract;
mod fan_out;
mod links;
mod login;
mod open;

pub use extract::ExtractRecords;
pub use fan_out::{form_relogin, FanOutExtract, Relogin};
pub use links::CollectLinks;
pub use login::FormLogin;
pub use open::OpenPage;

use crate::error::StepError;

fn template_error(err: anyhow::Error) -> StepError {
    StepError::Template(format!("{err:#}"))
}
