// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Fuse programmer tests over scripted bootloader consoles.
// Author: Lukas Bower

use std::time::Duration;

use forgebench::fuse::{FuseProgrammer, FuseStep};
use forgebench::mac::MacAddr;
use forgebench::policy::BootloaderPolicy;
use forgebench::serial::{ScriptedPort, SerialSession};
use forgebench::ProvisionError;

const CONFIRM: &str = "Really perform this fuse programming? <y/N>\r\n";

fn fast_timing() -> BootloaderPolicy {
    BootloaderPolicy {
        confirm_timeout_secs: 1,
        write_timeout_secs: 1,
        env_timeout_secs: 1,
        ..BootloaderPolicy::default()
    }
}

fn mac() -> MacAddr {
    "ab:cd:ef:12:34:56".parse().unwrap()
}

#[test]
fn burns_both_words_and_persists_the_environment() {
    let port = ScriptedPort::new()
        .on("fuse prog 4 2 0xef123456\r\n", CONFIRM)
        .on("fuse prog 4 3 0xabcd\r\n", CONFIRM)
        .on("y\r\n", "Programming bank 4 word 2... done\r\n=> ")
        .on("y\r\n", "Programming bank 4 word 3... done\r\n=> ")
        .on("setenv ethaddr ab:cd:ef:12:34:56\r\n", "=> ")
        .on("saveenv\r\n", "Saving Environment to MMC... OK\r\n=> ");
    let log = port.sent_log();
    let mut session = SerialSession::new(Box::new(port), Duration::from_millis(1));
    let timing = fast_timing();

    FuseProgrammer::new(&mut session, &timing).burn(&mac()).unwrap();

    let sent = log.text();
    let low = sent.find("fuse prog 4 2 0xef123456").unwrap();
    let high = sent.find("fuse prog 4 3 0xabcd").unwrap();
    assert!(low < high, "low word must be programmed first");
    assert!(sent.contains("setenv ethaddr ab:cd:ef:12:34:56"));
    assert!(sent.contains("saveenv"));
    assert!(sent.ends_with("reset\r\n"));
}

#[test]
fn missing_low_word_completion_stops_before_the_high_word() {
    // The confirmation arrives but the write never reports back.
    let port = ScriptedPort::new().on("fuse prog 4 2 0xef123456\r\n", CONFIRM);
    let log = port.sent_log();
    let mut session = SerialSession::new(Box::new(port), Duration::from_millis(1));
    let timing = fast_timing();

    let err = FuseProgrammer::new(&mut session, &timing).burn(&mac()).unwrap_err();
    assert!(matches!(
        err,
        ProvisionError::FuseWriteFailed {
            step: FuseStep::LowWord
        }
    ));
    assert!(err.is_fatal());
    assert!(
        !log.text().contains("fuse prog 4 3"),
        "high word must never be attempted after an uncertain low word"
    );
}

#[test]
fn stray_ok_output_does_not_count_as_env_persistence() {
    let port = ScriptedPort::new()
        .on("fuse prog 4 2 0xef123456\r\n", CONFIRM)
        .on("fuse prog 4 3 0xabcd\r\n", CONFIRM)
        .on("y\r\n", "done\r\n=> ")
        .on("y\r\n", "done\r\n=> ")
        .on("setenv ethaddr ab:cd:ef:12:34:56\r\n", "=> ")
        .on("saveenv\r\n", "Writing to MMC(1)... OKAY\r\n=> ");
    let mut session = SerialSession::new(Box::new(port), Duration::from_millis(1));
    let timing = fast_timing();

    let err = FuseProgrammer::new(&mut session, &timing).burn(&mac()).unwrap_err();
    assert!(matches!(
        err,
        ProvisionError::FuseWriteFailed {
            step: FuseStep::PersistEnv
        }
    ));
}

#[test]
fn missing_confirmation_prompt_names_the_step() {
    let port = ScriptedPort::new()
        .on("fuse prog 4 2 0xef123456\r\n", CONFIRM)
        .on("y\r\n", "done\r\n=> ");
    let mut session = SerialSession::new(Box::new(port), Duration::from_millis(1));
    let timing = fast_timing();

    let err = FuseProgrammer::new(&mut session, &timing).burn(&mac()).unwrap_err();
    assert!(matches!(
        err,
        ProvisionError::FuseConfirmationTimeout {
            step: FuseStep::HighWord
        }
    ));
}
