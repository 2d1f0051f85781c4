use chrono::NaiveDate;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::{
    allocation::{Allocation, allocate},
    credentials::{CredentialCipher, DecryptPass, fingerprint},
    cycle::{classify_days, remaining_days},
    domain::{ClassCounts, Customer, DomainError, Server, ServiceClass, validate_display_name},
    grouping::{CredentialGroup, CredentialKey, GlobalUsage, group_server},
    offer::{OfferCredential, SlotOffer, retain_for_plan, sort_offers},
    pricing::{ProRataQuote, pro_rata_quote},
    state::{CustomerStore, NewCustomer, Scope, SnapshotSource, StoreError},
};

/// Everything one offer computation reads, taken under a single store lock.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub servers: Vec<Server>,
    pub tenant_customers: Vec<Customer>,
    /// Cross-tenant; only used to count global shares.
    pub global_customers: Vec<Customer>,
}

impl Snapshot {
    pub fn read(source: &dyn SnapshotSource, tenant_id: &str) -> Self {
        Self {
            servers: source.list_servers(tenant_id),
            tenant_customers: source.list_customers(&Scope::Tenant(tenant_id.to_string())),
            global_customers: source.list_customers(&Scope::Global),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OfferQuery {
    pub server_id: Option<String>,
    pub plan_days: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OfferReport {
    pub offers: Vec<SlotOffer>,
    pub decrypt_fallbacks: u64,
}

pub async fn compute_offers(
    snapshot: &Snapshot,
    cipher: &dyn CredentialCipher,
    query: &OfferQuery,
    today: NaiveDate,
) -> OfferReport {
    let pass = DecryptPass::new(cipher);
    let (tenant, global) = tokio::join!(
        pass.decrypt_all(&snapshot.tenant_customers),
        pass.decrypt_all(&snapshot.global_customers),
    );
    let usage = GlobalUsage::from_customers(&global);

    let mut offers = Vec::new();
    for server in &snapshot.servers {
        if query
            .server_id
            .as_deref()
            .is_some_and(|id| id != server.server_id)
        {
            continue;
        }
        if server.slots_per_credential.is_zero() {
            debug!(
                server_id = server.server_id,
                "server has no slot capacity configured; skipping"
            );
            continue;
        }

        for group in group_server(&server.server_id, &tenant).into_values() {
            if let Some(offer) = offer_for_group(server, &group, &usage, today) {
                offers.push(offer);
            }
        }
    }

    if let Some(plan_days) = query.plan_days {
        retain_for_plan(&mut offers, plan_days);
    }
    sort_offers(&mut offers);
    debug!(
        offers = offers.len(),
        decrypt_calls = pass.decrypt_calls(),
        decrypt_fallbacks = pass.fallback_count(),
        "offer pass complete"
    );

    OfferReport {
        offers,
        decrypt_fallbacks: pass.fallback_count(),
    }
}

fn offer_for_group(
    server: &Server,
    group: &CredentialGroup,
    usage: &GlobalUsage,
    today: NaiveDate,
) -> Option<SlotOffer> {
    let global_usage = usage.count(&group.key.login);
    let available = match allocate(server.slots_per_credential, group.used(), global_usage) {
        Allocation::Available(counts) => counts,
        Allocation::Excluded(reason) => {
            debug!(
                server_id = server.server_id,
                credential = fingerprint(&group.key.login),
                ?reason,
                "credential group not offered"
            );
            return None;
        }
    };

    if group.has_mixed_expiry() {
        debug!(
            server_id = server.server_id,
            credential = fingerprint(&group.key.login),
            "credential group members disagree on expiration; using the earliest"
        );
    }
    let expires_on = group.representative_expiry();
    let remaining = expires_on.map(|d| remaining_days(d, today));
    let (stored_login, stored_password) = group.stored_credential();

    Some(SlotOffer {
        server_id: server.server_id.clone(),
        server_name: server.server_name.clone(),
        credential: OfferCredential {
            login: group.key.login.clone(),
            password: group.key.password.clone(),
        },
        stored_login,
        stored_password,
        available,
        member_names: group.member_names(),
        expires_on,
        remaining_days: remaining,
        duration: remaining.and_then(classify_days),
        quote: server.monthly_price.map(|p| pro_rata_quote(p, today)),
    })
}

#[derive(Debug, Clone)]
pub struct AttachRequest {
    pub tenant_id: String,
    pub server_id: String,
    pub login: String,
    pub password: Option<String>,
    pub service_class: ServiceClass,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Attached {
    pub customer: Customer,
    pub quote: Option<ProRataQuote>,
}

/// A credential's group on one server as the live store sees it, with its free slots.
struct CredentialRoom {
    group: Option<CredentialGroup>,
    available: ClassCounts,
}

/// Reads membership for `key` and the login's global usage, both from the current store state.
async fn credential_room<S: SnapshotSource + ?Sized>(
    store: &S,
    cipher: &dyn CredentialCipher,
    server: &Server,
    tenant_id: &str,
    key: &CredentialKey,
) -> CredentialRoom {
    let global_customers = store.list_customers(&Scope::Global);
    let pass = DecryptPass::new(cipher);
    let global = pass.decrypt_all(&global_customers).await;
    let usage = GlobalUsage::from_customers(&global);

    let tenant: Vec<_> = global
        .into_iter()
        .filter(|c| c.record.tenant_id == tenant_id)
        .collect();
    let group = group_server(&server.server_id, &tenant).remove(key);
    let used = group.as_ref().map(CredentialGroup::used).unwrap_or_default();
    let available = allocate(server.slots_per_credential, used, usage.count(&key.login))
        .available()
        .unwrap_or_default();
    CredentialRoom { group, available }
}

fn tenant_server<S: SnapshotSource + ?Sized>(
    store: &S,
    tenant_id: &str,
    server_id: &str,
) -> Result<Server, DomainError> {
    store
        .get_server(server_id)
        .filter(|s| s.tenant_id == tenant_id)
        .ok_or_else(|| DomainError::MissingServer {
            server_id: server_id.to_string(),
        })
}

/// Attach a new customer to an existing credential group.
///
/// Membership and global usage are re-read under the store lock, so the share cap holds
/// after the write no matter what offer the caller saw earlier.
pub async fn attach_customer<S: CustomerStore + Send>(
    store: &Mutex<S>,
    cipher: &dyn CredentialCipher,
    req: AttachRequest,
    today: NaiveDate,
) -> Result<Attached, StoreError> {
    validate_display_name(&req.display_name)?;

    let mut store = store.lock().await;
    let server = tenant_server(&*store, &req.tenant_id, &req.server_id)?;

    let key = CredentialKey::new(req.login.as_str(), req.password.as_deref().unwrap_or(""));
    let room = credential_room(&*store, cipher, &server, &req.tenant_id, &key).await;
    let Some(group) = room.group else {
        return Err(DomainError::CredentialNotFound {
            server_id: server.server_id.clone(),
        }
        .into());
    };
    if room.available.get(req.service_class) == 0 {
        return Err(DomainError::NoSlotAvailable {
            server_id: server.server_id.clone(),
            service_class: req.service_class,
        }
        .into());
    }

    let (login, password) = group.stored_credential();
    let customer = Customer {
        customer_id: crate::id::new_customer_id(),
        tenant_id: req.tenant_id,
        server_id: server.server_id.clone(),
        service_class: req.service_class,
        login,
        password,
        expires_on: group.representative_expiry(),
        display_name: req.display_name,
    };
    let customer = store.insert_customer(customer)?;
    info!(
        server_id = server.server_id,
        customer_id = customer.customer_id,
        credential = fingerprint(&key.login),
        service_class = req.service_class.as_str(),
        "customer attached to shared credential"
    );

    Ok(Attached {
        customer,
        quote: server.monthly_price.map(|p| pro_rata_quote(p, today)),
    })
}

/// Store a customer record with its own credential and expiration.
///
/// A credential already in use still has to have room: the record joins its group on the
/// server, and counts toward the login's global share cap.
pub async fn register_customer<S: CustomerStore + Send>(
    store: &Mutex<S>,
    cipher: &dyn CredentialCipher,
    new: NewCustomer,
) -> Result<Customer, StoreError> {
    validate_display_name(&new.display_name)?;

    let mut store = store.lock().await;
    let server = tenant_server(&*store, &new.tenant_id, &new.server_id)?;

    if let Some(login) = new.login.as_deref().filter(|l| !l.is_empty()) {
        let key = CredentialKey::new(login, new.password.as_deref().unwrap_or(""));
        let room = credential_room(&*store, cipher, &server, &new.tenant_id, &key).await;
        if room.available.get(new.service_class) == 0 {
            return Err(DomainError::NoSlotAvailable {
                server_id: server.server_id.clone(),
                service_class: new.service_class,
            }
            .into());
        }
    }

    let customer = store.create_customer(new)?;
    info!(
        server_id = server.server_id,
        customer_id = customer.customer_id,
        credential = ?customer.login.as_deref().map(fingerprint),
        service_class = customer.service_class.as_str(),
        "customer registered"
    );
    Ok(customer)
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;

    use crate::{
        allocation::MAX_SHARES,
        credentials::{PlaintextCipher, testing::FakeCipher},
        cycle::DurationCategory,
        state::{JsonSnapshotStore, StoreInit},
    };

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn server(id: &str, tenant: &str, a: u32, b: u32, price: Option<f64>) -> Server {
        Server {
            server_id: id.to_string(),
            tenant_id: tenant.to_string(),
            server_name: format!("name-{id}"),
            slots_per_credential: ClassCounts::new(a, b),
            monthly_price: price,
        }
    }

    fn customer(
        id: &str,
        tenant: &str,
        server_id: &str,
        class: ServiceClass,
        login: &str,
        expires_on: NaiveDate,
    ) -> Customer {
        Customer {
            customer_id: id.to_string(),
            tenant_id: tenant.to_string(),
            server_id: server_id.to_string(),
            service_class: class,
            login: Some(FakeCipher::seal(id, login)),
            password: Some(FakeCipher::seal(id, "pw")),
            expires_on: Some(expires_on),
            display_name: format!("name-{id}"),
        }
    }

    fn snapshot(servers: Vec<Server>, customers: Vec<Customer>, tenant: &str) -> Snapshot {
        Snapshot {
            servers,
            tenant_customers: customers
                .iter()
                .filter(|c| c.tenant_id == tenant)
                .cloned()
                .collect(),
            global_customers: customers,
        }
    }

    #[tokio::test]
    async fn global_usage_from_other_tenants_limits_offer() {
        let today = date(2025, 4, 20);
        let exp = date(2025, 5, 10);
        let snap = snapshot(
            vec![server("s1", "t1", 2, 1, Some(90.0))],
            vec![
                customer("c1", "t1", "s1", ServiceClass::A, "shared", exp),
                customer("c2", "t1", "s1", ServiceClass::A, "shared", exp),
                // Same login, other tenant and server: counts toward the cap.
                customer("c3", "t2", "s9", ServiceClass::B, "shared", exp),
            ],
            "t1",
        );
        let cipher = FakeCipher::default();
        let report = compute_offers(&snap, &cipher, &OfferQuery::default(), today).await;
        assert!(report.offers.is_empty());

        let snap = snapshot(snap.servers.clone(), snap.tenant_customers.clone(), "t1");
        let report = compute_offers(&snap, &cipher, &OfferQuery::default(), today).await;
        assert_eq!(report.offers.len(), 1);
        let offer = &report.offers[0];
        assert_eq!(offer.available, ClassCounts::new(0, 1));
        assert_eq!(offer.credential.login, "shared");
        assert_eq!(offer.stored_login.as_deref(), Some("enc:c1:shared"));
        assert_eq!(offer.member_names, vec!["name-c1", "name-c2"]);
        assert_eq!(offer.remaining_days, Some(20));
        assert_eq!(offer.duration, Some(DurationCategory::Monthly));
        let quote = offer.quote.unwrap();
        assert_eq!(quote.remaining_days, 11);
        assert!((quote.price - 33.0).abs() < 1e-9);
        assert_eq!(report.decrypt_fallbacks, 0);
    }

    #[tokio::test]
    async fn skips_unconfigured_servers_and_filters_by_plan_and_server() {
        let today = date(2025, 1, 1);
        let snap = snapshot(
            vec![
                server("s0", "t1", 0, 0, None),
                server("s1", "t1", 3, 0, None),
                server("s2", "t1", 3, 0, None),
            ],
            vec![
                customer("c0", "t1", "s0", ServiceClass::A, "u0", date(2025, 1, 10)),
                customer("c1", "t1", "s1", ServiceClass::A, "u1", date(2025, 3, 1)),
                customer("c2", "t1", "s2", ServiceClass::A, "u2", date(2025, 1, 20)),
            ],
            "t1",
        );
        let cipher = FakeCipher::default();

        let all = compute_offers(&snap, &cipher, &OfferQuery::default(), today).await;
        let ids: Vec<_> = all.offers.iter().map(|o| o.server_id.as_str()).collect();
        assert_eq!(ids, vec!["s2", "s1"]);
        assert!(all.offers.iter().all(|o| o.quote.is_none()));

        let query = OfferQuery {
            plan_days: Some(90),
            ..OfferQuery::default()
        };
        let quarterly = compute_offers(&snap, &cipher, &query, today).await;
        assert_eq!(quarterly.offers.len(), 1);
        assert_eq!(quarterly.offers[0].server_id, "s1");

        let query = OfferQuery {
            server_id: Some("s2".to_string()),
            ..OfferQuery::default()
        };
        let one = compute_offers(&snap, &cipher, &query, today).await;
        assert_eq!(one.offers.len(), 1);
        assert_eq!(one.offers[0].server_id, "s2");
    }

    #[tokio::test]
    async fn legacy_plaintext_rows_merge_with_encrypted_ones() {
        let today = date(2025, 1, 1);
        let exp = date(2025, 1, 30);
        let mut legacy = customer("c2", "t1", "s1", ServiceClass::B, "u", exp);
        legacy.login = Some("u".to_string());
        legacy.password = Some("pw".to_string());
        let snap = snapshot(
            vec![server("s1", "t1", 2, 2, None)],
            vec![customer("c1", "t1", "s1", ServiceClass::A, "u", exp), legacy],
            "t1",
        );
        let cipher = FakeCipher::default();
        let report = compute_offers(&snap, &cipher, &OfferQuery::default(), today).await;
        assert_eq!(report.offers.len(), 1);
        // Naive {A:1,B:1} squeezed into the one share left.
        assert_eq!(report.offers[0].available, ClassCounts::new(0, 1));
        assert_eq!(report.offers[0].member_names.len(), 2);
        assert!(report.decrypt_fallbacks >= 2);
    }

    fn seeded_store(tmp: &std::path::Path) -> (JsonSnapshotStore, Server) {
        let mut store = JsonSnapshotStore::load_or_init(StoreInit {
            data_dir: tmp.to_path_buf(),
        })
        .unwrap();
        let server = store
            .create_server("t1".into(), "srv".into(), ClassCounts::new(3, 2), Some(31.0))
            .unwrap();
        store
            .create_customer(NewCustomer {
                tenant_id: "t1".into(),
                server_id: server.server_id.clone(),
                service_class: ServiceClass::A,
                login: Some("u".into()),
                password: Some("p".into()),
                expires_on: Some(date(2025, 2, 1)),
                display_name: "first".into(),
            })
            .unwrap();
        (store, server)
    }

    fn attach_req(server_id: &str, name: &str, class: ServiceClass) -> AttachRequest {
        AttachRequest {
            tenant_id: "t1".into(),
            server_id: server_id.to_string(),
            login: "u".into(),
            password: Some("p".into()),
            service_class: class,
            display_name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn attach_reuses_stored_credential_and_stops_at_global_cap() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, server) = seeded_store(tmp.path());
        let store = Mutex::new(store);
        let today = date(2025, 1, 10);

        for name in ["second", "third"] {
            let attached = attach_customer(
                &store,
                &PlaintextCipher,
                attach_req(&server.server_id, name, ServiceClass::B),
                today,
            )
            .await
            .unwrap();
            assert_eq!(attached.customer.login.as_deref(), Some("u"));
            assert_eq!(attached.customer.expires_on, Some(date(2025, 2, 1)));
            assert_eq!(attached.quote.unwrap().remaining_days, 22);
        }

        let err = attach_customer(
            &store,
            &PlaintextCipher,
            attach_req(&server.server_id, "fourth", ServiceClass::A),
            today,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Domain(DomainError::NoSlotAvailable { .. })
        ));

        let store = store.lock().await;
        let sharing = store
            .list_customers(&Scope::Global)
            .into_iter()
            .filter(|c| c.login.as_deref() == Some("u"))
            .count();
        assert_eq!(sharing as u32, MAX_SHARES);
    }

    #[tokio::test]
    async fn attach_rejects_unknown_credential_and_foreign_server() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, server) = seeded_store(tmp.path());
        let store = Mutex::new(store);
        let today = date(2025, 1, 10);

        let mut req = attach_req(&server.server_id, "x", ServiceClass::A);
        req.password = Some("wrong".into());
        let err = attach_customer(&store, &PlaintextCipher, req, today)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Domain(DomainError::CredentialNotFound { .. })
        ));

        let mut req = attach_req(&server.server_id, "x", ServiceClass::A);
        req.tenant_id = "t2".into();
        let err = attach_customer(&store, &PlaintextCipher, req, today)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Domain(DomainError::MissingServer { .. })
        ));
    }

    #[tokio::test]
    async fn concurrent_attaches_cannot_both_take_the_last_share() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, server) = seeded_store(tmp.path());
        let store = Mutex::new(store);
        let today = date(2025, 1, 10);
        attach_customer(
            &store,
            &PlaintextCipher,
            attach_req(&server.server_id, "second", ServiceClass::B),
            today,
        )
        .await
        .unwrap();

        let (left, right) = tokio::join!(
            attach_customer(
                &store,
                &PlaintextCipher,
                attach_req(&server.server_id, "left", ServiceClass::B),
                today,
            ),
            attach_customer(
                &store,
                &PlaintextCipher,
                attach_req(&server.server_id, "right", ServiceClass::B),
                today,
            ),
        );
        let (ok, err): (Vec<_>, Vec<_>) = [left, right].into_iter().partition(Result::is_ok);
        assert_eq!(ok.len(), 1);
        assert_eq!(err.len(), 1);
        assert!(matches!(
            err.into_iter().next().unwrap(),
            Err(StoreError::Domain(DomainError::NoSlotAvailable { .. }))
        ));

        let sharing = store
            .lock()
            .await
            .list_customers(&Scope::Global)
            .into_iter()
            .filter(|c| c.login.as_deref() == Some("u"))
            .count();
        assert_eq!(sharing as u32, MAX_SHARES);
    }

    fn new_record(tenant_id: &str, server_id: &str, login: Option<&str>, name: &str) -> NewCustomer {
        NewCustomer {
            tenant_id: tenant_id.into(),
            server_id: server_id.to_string(),
            service_class: ServiceClass::B,
            login: login.map(str::to_string),
            password: Some("p".into()),
            expires_on: Some(date(2025, 3, 1)),
            display_name: name.to_string(),
        }
    }

    #[tokio::test]
    async fn register_starts_a_new_group_and_respects_the_share_cap() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, server) = seeded_store(tmp.path());
        let store = Mutex::new(store);

        let fresh = register_customer(
            &store,
            &PlaintextCipher,
            new_record("t1", &server.server_id, Some("v"), "solo"),
        )
        .await
        .unwrap();
        assert_eq!(fresh.login.as_deref(), Some("v"));
        assert_eq!(fresh.expires_on, Some(date(2025, 3, 1)));

        // "u" already has one member; two more records reach the cap.
        for name in ["b1", "b2"] {
            register_customer(
                &store,
                &PlaintextCipher,
                new_record("t1", &server.server_id, Some("u"), name),
            )
            .await
            .unwrap();
        }
        let err = register_customer(
            &store,
            &PlaintextCipher,
            new_record("t1", &server.server_id, Some("u"), "b3"),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Domain(DomainError::NoSlotAvailable { .. })
        ));

        let snapshot = Snapshot::read(&*store.lock().await, "t1");
        let report =
            compute_offers(&snapshot, &PlaintextCipher, &OfferQuery::default(), date(2025, 1, 10))
                .await;
        let logins: Vec<_> = report
            .offers
            .iter()
            .map(|o| o.credential.login.as_str())
            .collect();
        assert_eq!(logins, vec!["v"]);
    }

    #[tokio::test]
    async fn register_rejects_foreign_server_and_allows_records_without_login() {
        let tmp = tempfile::tempdir().unwrap();
        let (store, server) = seeded_store(tmp.path());
        let store = Mutex::new(store);

        let err = register_customer(
            &store,
            &PlaintextCipher,
            new_record("t2", &server.server_id, Some("u"), "intruder"),
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Domain(DomainError::MissingServer { .. })
        ));

        let bare = register_customer(
            &store,
            &PlaintextCipher,
            new_record("t1", &server.server_id, None, "pending"),
        )
        .await
        .unwrap();
        assert_eq!(bare.login, None);
        assert_eq!(store.lock().await.list_customers(&Scope::Global).len(), 2);
    }
}
