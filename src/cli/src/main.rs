// SPDX-FileCopyrightText: 2025 Caution SEZC
// SPDX-License-Identifier: AGPL-3.0-only OR LicenseRef-Commercial

#[tokio::main]
async fn main() {
    if let Err(e) = cli::run().await {
        eprintln!("\nError: {e}");

        for cause in e.chain().skip(1) {
            eprintln!("Caused by: {cause}");
        }

        std::process::exit(1);
    }
}
