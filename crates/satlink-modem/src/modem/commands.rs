//! SIM and identity commands.
//!
//! Thin wrappers over single AT exchanges that the session and the
//! transfer cycle need outside the fixed setup sequence.

use crate::modem::at::{AtCommands, Link};
use crate::modem::types::*;

/// Default PIN of Iridium SIM cards.
pub const DEFAULT_SIM_PIN: &str = "1111";

/// Transceiver models that support circuit-switched data calls and need
/// the bearer service / auto-answer configuration.
pub const DATA_CAPABLE_MODELS: &[&str] = &["9522B", "A3LAr", "A3LA-r", "9523"];

pub fn is_data_capable(model: &str) -> bool {
    DATA_CAPABLE_MODELS.iter().any(|m| m.eq_ignore_ascii_case(model.trim()))
}

/// Model identification (`AT+CGMM`).
pub async fn read_model(link: &Link) -> SerialResult<String> {
    link.ask(AtCommands::MODEL).await
}

/// SIM card ICCID (`AT+CICCID`), the answer line is the id itself.
pub async fn read_iccid(link: &Link) -> SerialResult<String> {
    let iccid = link.ask(AtCommands::ICCID).await?;
    if iccid.is_empty() || !iccid.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(SerialError::malformed(
            AtCommands::ICCID,
            format!("unexpected ICCID '{}'", iccid),
        ));
    }
    log::info!("SIM ICCID is {}", iccid);
    Ok(iccid)
}

/// Unlock the SIM with its PIN.  `Ok(true)` when the modem answered OK.
pub async fn unlock_sim(link: &Link, pin: &str) -> SerialResult<bool> {
    let ok = expect_ok(link, &AtCommands::sim_pin(pin)).await?;
    if ok {
        log::info!("SIM unlocked");
    }
    Ok(ok)
}

/// Enable or disable the SIM PIN requirement (current PIN needed).
pub async fn set_sim_lock(link: &Link, enable: bool, pin: &str) -> SerialResult<bool> {
    let ok = expect_ok(link, &AtCommands::sim_lock(enable, pin)).await?;
    if ok {
        log::info!("SIM PIN requirement {}", if enable { "enabled" } else { "disabled" });
    }
    Ok(ok)
}

/// `Ok(true)` on `OK`, `Ok(false)` on `ERROR` or any other answer.
/// Transport failures (`NoAnswer`, I/O) are still errors.
pub async fn expect_ok(link: &Link, phrase: &str) -> SerialResult<bool> {
    match link.ask(phrase).await {
        Ok(answer) => Ok(answer.eq_ignore_ascii_case("OK")),
        Err(e) if e.kind == SerialErrorKind::ModemError => Ok(false),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modem::at::AtTiming;
    use crate::modem::transport::SimulatedTransport;

    async fn link_with<F>(f: F) -> Link
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        let t = SimulatedTransport::new("/dev/ttyS1");
        t.set_responder(f);
        Link::open(t, SerialConfig::for_port("/dev/ttyS1"), AtTiming::default())
            .await
            .unwrap()
    }

    #[test]
    fn test_data_capable_models() {
        assert!(is_data_capable("9522B"));
        assert!(is_data_capable(" a3lar "));
        assert!(!is_data_capable("9602"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_iccid() {
        let link = link_with(|_| Some("\r\n8988169312004123456\r\n\r\nOK\r\n".into())).await;
        assert_eq!(read_iccid(&link).await.unwrap(), "8988169312004123456");
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_iccid_garbage() {
        let link = link_with(|_| Some("\r\n+CICCID: ???\r\n\r\nOK\r\n".into())).await;
        let err = read_iccid(&link).await.unwrap_err();
        assert_eq!(err.kind, SerialErrorKind::Malformed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlock_sim() {
        let link = link_with(|cmd| {
            if cmd == "AT+CPIN=\"1111\"" {
                Some("\r\nOK\r\n".into())
            } else {
                Some("\r\nERROR\r\n".into())
            }
        })
        .await;
        assert!(unlock_sim(&link, DEFAULT_SIM_PIN).await.unwrap());
        assert!(!unlock_sim(&link, "0000").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_sim_lock_no_answer_is_error() {
        let link = link_with(|_| None).await;
        let err = set_sim_lock(&link, false, DEFAULT_SIM_PIN).await.unwrap_err();
        assert_eq!(err.kind, SerialErrorKind::NoAnswer);
    }
}
