//! SELECT by application identifier

use hwkey_apdu_core::Command;
use tracing::debug;

use crate::error::Error;

/// Instruction byte of SELECT
pub const INS_SELECT: u8 = 0xA4;

/// P1 of SELECT by DF name
pub const P1_SELECT_BY_NAME: u8 = 0x04;

/// Build a SELECT command for the given AID
pub fn select_command(aid: &[u8]) -> Command {
    Command::new_with_data(0x00, INS_SELECT, P1_SELECT_BY_NAME, 0x00, aid.to_vec()).with_ne(256)
}

/// Try each candidate AID in order until one can be selected
///
/// `File not found` moves on to the next candidate, any other failure stops
/// the search. Returns the selected AID together with what `select` produced.
pub(crate) fn select_first<T>(
    aids: &[Vec<u8>],
    applet: &'static str,
    mut select: impl FnMut(&[u8]) -> Result<T, Error>,
) -> Result<(Vec<u8>, T), Error> {
    for aid in aids {
        match select(aid) {
            Ok(value) => return Ok((aid.clone(), value)),
            Err(Error::FileNotFound) => {
                debug!(applet, aid = %hex::encode(aid), "Applet not found, trying next AID");
            }
            Err(e) => return Err(e),
        }
    }
    Err(Error::SelectApplet { applet })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_command_encoding() {
        let command = select_command(&hex::decode("A000000308").unwrap());
        assert_eq!(command.to_bytes().as_ref(), hex::decode("00A4040005A00000030800").unwrap());
    }

    #[test]
    fn test_select_first_skips_missing_applets() {
        let aids = vec![vec![0x01], vec![0x02], vec![0x03]];
        let mut tried = Vec::new();

        let (aid, value) = select_first(&aids, "test", |aid| {
            tried.push(aid[0]);
            if aid[0] == 0x02 { Ok("found") } else { Err(Error::FileNotFound) }
        })
        .unwrap();

        assert_eq!(aid, vec![0x02]);
        assert_eq!(value, "found");
        assert_eq!(tried, vec![0x01, 0x02]);
    }

    #[test]
    fn test_select_first_stops_on_other_errors() {
        let aids = vec![vec![0x01], vec![0x02]];
        let result = select_first::<()>(&aids, "test", |_| Err(Error::ClassNotSupported));
        assert!(matches!(result, Err(Error::ClassNotSupported)));

        let result = select_first::<()>(&aids, "test", |_| Err(Error::FileNotFound));
        assert!(matches!(result, Err(Error::SelectApplet { applet: "test" })));
    }
}
