// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Provisioning tests.

mod common;

use std::sync::Arc;

use common::TestContext;
use trybox::provision::{CONSOLE_ONLY_ADDRESS, INSTANCE_PREFIX, Provisioner};
use trybox::runtime::{AddressFamily, ContainerRuntime, InstanceAddress};

const CONSOLE_ONLY_CONFIG: &str = r#"
image: ubuntu/22.04
quota_time: 3600
server_console_only: true
server_terms: Be nice.
"#;

const TEMPLATE_CONFIG: &str = r#"
container: trybox-base
quota_time: 3600
server_console_only: true
server_terms: Be nice.
"#;

fn provisioner(ctx: &TestContext) -> (Provisioner, Arc<trybox::ExpiryScheduler>) {
    let scheduler = ctx.scheduler();
    (
        Provisioner::new(ctx.db.clone(), ctx.runtime.clone(), scheduler.clone()),
        scheduler,
    )
}

fn give_default_address(ctx: &TestContext, address: &str) {
    ctx.runtime.set_default_addresses(vec![InstanceAddress {
        interface: "eth0".to_string(),
        family: AddressFamily::Inet,
        scope: "global".to_string(),
        address: address.to_string(),
    }]);
}

#[tokio::test]
async fn provisions_registers_and_arms_timer() {
    let ctx = TestContext::new().await;
    give_default_address(&ctx, "10.0.3.77");
    let (provisioner, scheduler) = provisioner(&ctx);

    let config = ctx.config_snapshot();
    let session = provisioner.provision(&config, "192.0.2.1").await.unwrap();

    assert!(session.instance_name.starts_with(INSTANCE_PREFIX));
    assert_eq!(session.address, "10.0.3.77");
    assert!(!session.username.is_empty());
    assert!(!session.password.is_empty());

    // The session is queryable by its token.
    let record = ctx
        .db
        .get_by_token(&session.token, true)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.instance_name, session.instance_name);
    assert_eq!(record.instance_ip, "10.0.3.77");
    assert_eq!(record.request_ip, "192.0.2.1");
    assert_eq!(record.instance_expiry, session.expiry);

    // Expiry timer armed for the new session.
    assert_eq!(scheduler.timer_count(), 1);

    // Image source, limits applied, instance started.
    let calls = ctx.runtime.calls();
    assert!(calls.iter().any(|c| c.starts_with("init ")));
    assert!(calls.iter().any(|c| c.starts_with("configure ")));
    assert!(calls.iter().any(|c| c.starts_with("start ")));

    // quota_ram: 256 from the default test config.
    let limits = ctx.runtime.limits(&session.instance_name).unwrap();
    assert_eq!(limits.memory_mb, Some(256));
    assert_eq!(limits.cpu, None);

    // Login account injected through cloud-init.
    let options = ctx.runtime.create_options(&session.instance_name).unwrap();
    assert_eq!(options.config.get("security.nesting").unwrap(), "true");
    let user_data = options.config.get("user.user-data").unwrap();
    assert!(user_data.contains(&format!("name: {}", session.username)));
    assert!(user_data.contains(&format!("plain_text_passwd: {}", session.password)));
}

#[tokio::test]
async fn console_only_skips_account_and_address() {
    let ctx = TestContext::with_config(CONSOLE_ONLY_CONFIG).await;
    let (provisioner, _scheduler) = provisioner(&ctx);

    let config = ctx.config_snapshot();
    let session = provisioner.provision(&config, "192.0.2.1").await.unwrap();

    assert_eq!(session.address, CONSOLE_ONLY_ADDRESS);

    // No address polling and no login account.
    let calls = ctx.runtime.calls();
    assert!(!calls.iter().any(|c| c.starts_with("addresses ")));
    let options = ctx.runtime.create_options(&session.instance_name).unwrap();
    assert!(!options.config.contains_key("user.user-data"));
}

#[tokio::test]
async fn template_config_clones_instead_of_init() {
    let ctx = TestContext::with_config(TEMPLATE_CONFIG).await;
    let (provisioner, _scheduler) = provisioner(&ctx);

    let config = ctx.config_snapshot();
    let session = provisioner.provision(&config, "192.0.2.1").await.unwrap();

    let calls = ctx.runtime.calls();
    assert!(calls.iter().any(|c| c.starts_with("copy ")));
    assert!(!calls.iter().any(|c| c.starts_with("init ")));
    assert!(ctx.runtime.instance_exists(&session.instance_name));
}

#[tokio::test]
async fn failed_start_rolls_back_instance_and_session() {
    let ctx = TestContext::with_config(CONSOLE_ONLY_CONFIG).await;
    ctx.runtime.fail_start(true);
    let (provisioner, scheduler) = provisioner(&ctx);

    let config = ctx.config_snapshot();
    let result = provisioner.provision(&config, "192.0.2.1").await;
    assert!(result.is_err());

    // Instance rolled back, nothing registered, no timer armed.
    let deleted = ctx.runtime.deleted();
    assert_eq!(deleted.len(), 1);
    assert!(deleted[0].starts_with(INSTANCE_PREFIX));
    assert!(!ctx.runtime.instance_exists(&deleted[0]));
    assert_eq!(ctx.db.count_active().await.unwrap(), 0);
    assert_eq!(scheduler.timer_count(), 0);
}

#[tokio::test]
async fn failed_create_leaves_nothing_behind() {
    let ctx = TestContext::with_config(CONSOLE_ONLY_CONFIG).await;
    ctx.runtime.fail_create(true);
    let (provisioner, scheduler) = provisioner(&ctx);

    let config = ctx.config_snapshot();
    assert!(provisioner.provision(&config, "192.0.2.1").await.is_err());

    assert_eq!(ctx.db.count_active().await.unwrap(), 0);
    assert_eq!(scheduler.timer_count(), 0);
    assert!(ctx.runtime.list_names(INSTANCE_PREFIX).await.unwrap().is_empty());
}

#[tokio::test]
async fn ipv6_only_skips_ipv4_addresses() {
    let ctx = TestContext::with_config(
        r#"
image: ubuntu/22.04
quota_time: 3600
server_ipv6_only: true
server_terms: Be nice.
"#,
    )
    .await;
    ctx.runtime.set_default_addresses(vec![
        InstanceAddress {
            interface: "eth0".to_string(),
            family: AddressFamily::Inet,
            scope: "global".to_string(),
            address: "10.0.3.77".to_string(),
        },
        InstanceAddress {
            interface: "eth0".to_string(),
            family: AddressFamily::Inet6,
            scope: "global".to_string(),
            address: "2001:db8::7".to_string(),
        },
    ]);
    let (provisioner, _scheduler) = provisioner(&ctx);

    let config = ctx.config_snapshot();
    let session = provisioner.provision(&config, "192.0.2.1").await.unwrap();
    assert_eq!(session.address, "2001:db8::7");
}
