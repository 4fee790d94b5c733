//! Error handling foundation for switchboard.
//!
//! Only the `Result` alias lives here. Each crate owns its error enums and
//! wraps lower-layer reports with `.context()` on the way up.

use rootcause::Report;

/// Result alias over a rootcause report carrying context `C`.
pub type Result<T, C = ()> = std::result::Result<T, Report<C>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_alias_carries_context_type() {
        let ok: Result<&str, std::fmt::Error> = Ok("fine");
        assert_eq!(ok.expect("should be ok"), "fine");
    }
}
