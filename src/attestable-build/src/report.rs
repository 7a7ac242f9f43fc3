// SPDX-FileCopyrightText: 2025 Caution SEZC
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Commercial

use crate::attestation::VerifiedDocument;

/// Human-readable summary of a verified attestation, saved as `<output>.txt`.
pub fn render_markdown(document: &VerifiedDocument) -> String {
    let user_data = pretty_user_data(&document.user_data);
    format!(
        "## Attestation Report\n**PCR0**: \n `0x{}`\n\n**Report User Data**:\n```\n{}\n```\n",
        hex::encode(document.measurement()),
        user_data,
    )
}

/// Tab-indented JSON if the user data parses, otherwise the raw text.
pub fn pretty_user_data(user_data: &[u8]) -> String {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(user_data) else {
        return String::from_utf8_lossy(user_data).into_owned();
    };

    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"\t");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    match serde::Serialize::serialize(&value, &mut serializer) {
        Ok(()) => String::from_utf8_lossy(&out).into_owned(),
        Err(_) => String::from_utf8_lossy(user_data).into_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_markdown_layout() {
        let document = VerifiedDocument {
            module_id: "i-0abc-enc0".into(),
            timestamp: 1_700_000_000_000,
            pcrs: BTreeMap::from([(0, vec![0xab; 2])]),
            user_data: br#"{"nonce":"00ff"}"#.to_vec(),
            nonce: None,
        };
        assert_eq!(
            render_markdown(&document),
            "## Attestation Report\n**PCR0**: \n `0xabab`\n\n**Report User Data**:\n```\n{\n\t\"nonce\": \"00ff\"\n}\n```\n"
        );
    }

    #[test]
    fn test_non_json_user_data_kept_verbatim() {
        assert_eq!(pretty_user_data(b"plain"), "plain");
    }
}
