//! Credential lifecycle: onboarding, login, lock, password change, reset
//!
//! Every multi-step mutation of credential state runs under `mutation`, so
//! two password changes (or a change racing a migration) can never
//! interleave their re-encryption passes.

pub mod migrations;

use bip39::Mnemonic;
use rand::RngCore;
use serde_json::json;
use std::sync::Arc;

use crate::analytics::{self, Analytics};
use crate::config::{AuthConfig, WalletConfig};
use crate::error::{ensure_valid, ExtensionError, ExtensionResult};
use crate::keyring::{Account, AccountMeta, AccountOrigin, KeyType, Keyring};
use crate::protocol::{ChangePasswordRequest, OnboardRequest};
use crate::storage::password::AuthSecret;
use crate::storage::{AuthorizedSite, LoggedIn, Onboarded, Stores};
use crate::window::WindowManager;

pub struct Credentials {
    stores: Arc<Stores>,
    keyring: Arc<dyn Keyring>,
    windows: Arc<WindowManager>,
    analytics: Arc<dyn Analytics>,
    auth: AuthConfig,
    wallet: WalletConfig,
    mutation: tokio::sync::Mutex<()>,
}

/// Fresh 12-word phrase
fn generate_mnemonic() -> ExtensionResult<String> {
    let mut entropy = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut entropy);
    let mnemonic = Mnemonic::from_entropy(&entropy)
        .map_err(|e| anyhow::anyhow!("Failed to generate mnemonic: {}", e))?;
    Ok(mnemonic.to_string())
}

impl Credentials {
    pub fn new(
        stores: Arc<Stores>,
        keyring: Arc<dyn Keyring>,
        windows: Arc<WindowManager>,
        analytics: Arc<dyn Analytics>,
        auth: AuthConfig,
        wallet: WalletConfig,
    ) -> Self {
        Self {
            stores,
            keyring,
            windows,
            analytics,
            auth,
            wallet,
            mutation: tokio::sync::Mutex::new(()),
        }
    }

    async fn login_delay(&self) {
        if self.auth.delay_ms > 0 {
            tokio::time::sleep(self.auth.delay()).await;
        }
    }

    /// The account login falls back to when no verifier exists yet
    pub async fn primary_account(&self) -> ExtensionResult<Option<Account>> {
        let accounts = self.keyring.accounts().await?;
        let primary = accounts
            .iter()
            .find(|a| a.key_type == KeyType::Primary && a.meta.origin != AccountOrigin::Derived)
            .or_else(|| accounts.first())
            .cloned();
        Ok(primary)
    }

    pub async fn onboard(&self, request: OnboardRequest) -> ExtensionResult<Onboarded> {
        self.login_delay().await;

        let OnboardRequest {
            pass,
            pass_confirm,
            mnemonic,
        } = request;
        ensure_valid(!pass.is_empty(), "Password cannot be empty")?;
        ensure_valid(!pass_confirm.is_empty(), "Password confirm cannot be empty")?;
        ensure_valid(pass == pass_confirm, "Passwords do not match")?;

        let _guard = self.mutation.lock().await;
        ensure_valid(!self.stores.app.get_is_onboarded(), "A root account already exists")?;
        ensure_valid(self.keyring.accounts().await?.is_empty(), "Accounts already exist")?;

        // The wallet's own web app is connected before any key exists
        let domain = &self.wallet.domain;
        self.stores
            .sites
            .set(AuthorizedSite {
                id: domain.clone(),
                origin: "Frost Wallet".to_string(),
                url: format!("https://{}", domain),
                connect_all_substrate: true,
                ..Default::default()
            })
            .await?;

        let (mnemonic, imported) = match mnemonic {
            Some(phrase) => {
                ensure_valid(Mnemonic::parse(&phrase).is_ok(), "Supplied mnemonic is not valid")?;
                (phrase, true)
            }
            None => (generate_mnemonic()?, false),
        };

        let password = &self.stores.password;
        let (hashed, salt) = password.create_password(&pass);
        let AuthSecret { secret, check } = password.create_auth_secret(&hashed)?;
        password
            .update(|data| {
                data.password_version = 2;
                data.is_trimmed = false;
                data.is_hashed = true;
                data.salt = Some(salt);
                data.secret = Some(secret);
                data.check = Some(check);
            })
            .await?;
        password.set_password(hashed.clone());

        let primary = self
            .keyring
            .add_uri(
                &mnemonic,
                &self.wallet.primary_derivation_path,
                KeyType::Primary,
                &hashed,
                AccountMeta {
                    name: "My Primary Account".to_string(),
                    origin: if imported {
                        AccountOrigin::SeedStored
                    } else {
                        AccountOrigin::Generated
                    },
                    parent: None,
                    derivation_path: None,
                },
            )
            .await?;
        // Imported phrases are already backed up by definition
        self.stores.seed_phrase.add(&mnemonic, &hashed, imported).await?;

        let eth_path = &self.wallet.ethereum_derivation_path;
        if let Err(e) = self
            .keyring
            .add_uri(
                &mnemonic,
                eth_path,
                KeyType::Ethereum,
                &hashed,
                AccountMeta {
                    name: "My Ethereum Account".to_string(),
                    origin: AccountOrigin::Derived,
                    parent: Some(primary.address.clone()),
                    derivation_path: Some(eth_path.clone()),
                },
            )
            .await
        {
            // Not fatal: the user could not recover from a half-onboarded wallet
            tracing::error!("Failed to derive Ethereum account: {:#}", e);
        }

        let onboarded = self.stores.app.set_onboarded(imported).await?;
        let method = if imported { "import" } else { "new" };
        tracing::info!("Wallet onboarded ({})", method);
        analytics::capture(&self.analytics, "onboarded", Some(json!({ "method": method }))).await;

        Ok(onboarded)
    }

    /// Returns false (with the session cleared) on any failure
    pub async fn authenticate(&self, pass: &str) -> bool {
        self.login_delay().await;

        let _guard = self.mutation.lock().await;
        match self.try_authenticate(pass).await {
            Ok(()) => {
                analytics::capture(&self.analytics, "authenticate", None).await;
                true
            }
            Err(e) => {
                tracing::debug!("Authentication failed: {}", e);
                self.stores.password.clear_password();
                false
            }
        }
    }

    async fn try_authenticate(&self, pass: &str) -> ExtensionResult<()> {
        let password = &self.stores.password;
        if password.has_auth_secret() {
            return password.authenticate(pass);
        }

        // Legacy wallet: prove the password by unlocking the primary key,
        // then set up the verifier for next time
        let transformed = password.transform_password(pass)?;
        let primary = self
            .primary_account()
            .await?
            .ok_or_else(|| ExtensionError::auth("No primary account, unable to authorise"))?;
        self.keyring
            .unlock_check(&primary.address, &transformed)
            .await
            .map_err(|_| ExtensionError::auth("Incorrect password"))?;

        password.setup_auth_secret(&transformed).await?;
        password.set_password(transformed);
        tracing::info!("Password verifier established for legacy wallet");
        Ok(())
    }

    pub fn auth_status(&self) -> LoggedIn {
        self.stores.password.is_logged_in()
    }

    pub fn lock(&self) -> LoggedIn {
        self.stores.password.clear_password();
        self.auth_status()
    }

    pub fn check_password(&self, password: &str) -> ExtensionResult<bool> {
        self.stores.password.check_password(password)?;
        Ok(true)
    }

    pub async fn change_password(&self, request: ChangePasswordRequest) -> ExtensionResult<bool> {
        let _guard = self.mutation.lock().await;

        if !self.stores.seed_phrase.is_confirmed() {
            return Err(ExtensionError::policy(
                "Please backup your seed phrase before attempting to change your password.",
            ));
        }
        ensure_valid(
            request.new_pw == request.new_pw_confirm,
            "New password and new password confirmation must match",
        )?;

        let password = &self.stores.password;
        password.check_password(&request.current_pw)?;

        let (hashed_new, new_salt) = if password.data().is_hashed {
            (password.get_hashed_password(&request.new_pw)?, None)
        } else {
            let (hashed, salt) = password.create_password(&request.new_pw);
            (hashed, Some(salt))
        };
        let transformed_current = password.transform_password(&request.current_pw)?;

        migrations::reencrypt_everything(
            self.keyring.as_ref(),
            &self.stores.seed_phrase,
            &transformed_current,
            &hashed_new,
        )
        .await
        .map_err(|e| ExtensionError::Migration(format!("{:#}", e)))?;

        // Verifier is only replaced once every key uses the new password
        let AuthSecret { secret, check } = password.create_auth_secret(&hashed_new)?;
        password
            .update(|data| {
                data.secret = Some(secret);
                data.check = Some(check);
                data.is_trimmed = false;
                data.is_hashed = true;
                data.password_version = 2;
                if let Some(salt) = new_salt {
                    data.salt = Some(salt);
                }
            })
            .await?;
        password.set_password(hashed_new);

        tracing::info!("Password changed");
        Ok(true)
    }

    /// Record whether the user has backed up the seed phrase. Needs an
    /// unlocked session.
    pub async fn confirm_mnemonic(&self, confirmed: bool) -> ExtensionResult<bool> {
        let _guard = self.mutation.lock().await;

        if self.stores.password.get_password().is_none() {
            return Err(ExtensionError::auth("Unauthorised"));
        }
        self.stores.seed_phrase.set_confirmed(confirmed).await?;
        tracing::info!(confirmed, "Seed phrase backup recorded");
        Ok(true)
    }

    /// Forget every key and all credential state, then send the user back
    /// to onboarding
    pub async fn reset_wallet(&self) -> ExtensionResult<bool> {
        let _guard = self.mutation.lock().await;

        for account in self.keyring.accounts().await? {
            self.keyring.forget_account(&account.address).await?;
        }
        self.stores.app.set_not_onboarded().await?;
        self.stores.password.reset().await?;
        self.stores.seed_phrase.clear().await?;

        if let Err(e) = self
            .windows
            .open_onboarding(Some("/import?resetWallet=true"), None, false)
            .await
        {
            tracing::warn!("Failed to open onboarding after reset: {:#}", e);
        }

        // No keys left, so no site can keep its accounts
        self.stores.sites.clear().await?;

        tracing::warn!("Wallet reset");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    const PHRASE: &str =
        "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

    fn onboard_request(pass: &str, confirm: &str, mnemonic: Option<&str>) -> OnboardRequest {
        OnboardRequest {
            pass: pass.to_string(),
            pass_confirm: confirm.to_string(),
            mnemonic: mnemonic.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_onboard_then_authenticate() {
        let env = testing::credentials().await;
        let creds = &env.credentials;

        let onboarded = creds.onboard(onboard_request("pw", "pw", None)).await.unwrap();
        assert_eq!(onboarded, Onboarded::True);
        assert!(env.stores.app.get_is_onboarded());
        assert_eq!(creds.auth_status(), LoggedIn::True);

        let accounts = env.keyring.accounts().await.unwrap();
        assert_eq!(accounts.len(), 2);
        assert_eq!(accounts[1].key_type, KeyType::Ethereum);
        assert_eq!(accounts[1].meta.parent.as_deref(), Some(accounts[0].address.as_str()));
        assert!(!env.stores.seed_phrase.is_confirmed());

        let site = env
            .stores
            .sites
            .get_site_from_url("https://app.frost-wallet.io")
            .unwrap();
        assert!(site.connect_all_substrate);

        assert_eq!(creds.lock(), LoggedIn::False);
        assert!(!creds.authenticate("wrong").await);
        assert!(creds.authenticate("pw").await);
        assert_eq!(creds.auth_status(), LoggedIn::True);

        assert_eq!(
            env.analytics.events(),
            vec!["onboarded".to_string(), "authenticate".to_string()]
        );
    }

    #[tokio::test]
    async fn test_onboard_password_mismatch() {
        let env = testing::credentials().await;
        let err = env
            .credentials
            .onboard(onboard_request("pw", "other", None))
            .await
            .unwrap_err();

        assert!(matches!(err, ExtensionError::Validation(ref m) if m == "Passwords do not match"));
        assert!(!env.stores.app.get_is_onboarded());
        assert!(env.keyring.accounts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_onboard_rejects_bad_mnemonic_and_second_onboard() {
        let env = testing::credentials().await;
        let creds = &env.credentials;

        let err = creds
            .onboard(onboard_request("pw", "pw", Some("not a real phrase")))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtensionError::Validation(_)));

        creds.onboard(onboard_request("pw", "pw", Some(PHRASE))).await.unwrap();
        assert!(env.stores.seed_phrase.is_confirmed());

        let err = creds.onboard(onboard_request("pw", "pw", None)).await.unwrap_err();
        assert!(matches!(err, ExtensionError::Validation(ref m) if m == "A root account already exists"));
    }

    #[tokio::test]
    async fn test_failed_login_clears_session() {
        let env = testing::credentials().await;
        let creds = &env.credentials;
        creds.onboard(onboard_request("pw", "pw", None)).await.unwrap();
        assert_eq!(creds.auth_status(), LoggedIn::True);

        assert!(!creds.authenticate("nope").await);
        assert_eq!(creds.auth_status(), LoggedIn::False);
    }

    #[tokio::test]
    async fn test_legacy_login_sets_up_verifier() {
        let env = testing::legacy_wallet("old pw", PHRASE).await;
        let creds = &env.credentials;
        assert!(!env.stores.password.has_auth_secret());

        assert!(!creds.authenticate("wrong").await);
        assert!(!env.stores.password.has_auth_secret());

        assert!(creds.authenticate("old pw").await);
        assert!(env.stores.password.has_auth_secret());

        // Second login goes through the verifier
        creds.lock();
        assert!(creds.authenticate("old pw").await);
    }

    #[tokio::test]
    async fn test_change_password_requires_backup() {
        let env = testing::credentials().await;
        let creds = &env.credentials;
        creds.onboard(onboard_request("pw", "pw", None)).await.unwrap();

        let err = creds
            .change_password(ChangePasswordRequest {
                current_pw: "pw".to_string(),
                new_pw: "new".to_string(),
                new_pw_confirm: "new".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ExtensionError::Policy(_)));

        creds.lock();
        let locked = creds.confirm_mnemonic(true).await.unwrap_err();
        assert!(matches!(locked, ExtensionError::Auth(_)));
        assert!(!env.stores.seed_phrase.is_confirmed());

        assert!(creds.authenticate("pw").await);
        assert!(creds.confirm_mnemonic(true).await.unwrap());
        assert!(env.stores.seed_phrase.is_confirmed());
        assert!(creds
            .change_password(ChangePasswordRequest {
                current_pw: "pw".to_string(),
                new_pw: "new".to_string(),
                new_pw_confirm: "new".to_string(),
            })
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_change_password() {
        let env = testing::credentials().await;
        let creds = &env.credentials;
        creds.onboard(onboard_request("pw", "pw", Some(PHRASE))).await.unwrap();

        let mismatch = creds
            .change_password(ChangePasswordRequest {
                current_pw: "pw".to_string(),
                new_pw: "new".to_string(),
                new_pw_confirm: "newer".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(mismatch, ExtensionError::Validation(_)));

        let wrong = creds
            .change_password(ChangePasswordRequest {
                current_pw: "guess".to_string(),
                new_pw: "new".to_string(),
                new_pw_confirm: "new".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(wrong, ExtensionError::Auth(_)));

        assert!(creds
            .change_password(ChangePasswordRequest {
                current_pw: "pw".to_string(),
                new_pw: "new".to_string(),
                new_pw_confirm: "new".to_string(),
            })
            .await
            .unwrap());

        creds.lock();
        assert!(!creds.authenticate("pw").await);
        assert!(creds.authenticate("new").await);

        let hashed = env.stores.password.get_password().unwrap();
        assert_eq!(env.stores.seed_phrase.get_seed(&hashed).await.unwrap(), PHRASE);
        for account in env.keyring.accounts().await.unwrap() {
            env.keyring.unlock_check(&account.address, &hashed).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_change_password_rolls_back_on_keyring_failure() {
        let env = testing::credentials().await;
        let creds = &env.credentials;
        creds.onboard(onboard_request("pw", "pw", Some(PHRASE))).await.unwrap();
        let before = env.stores.password.data();

        env.keyring.fail_reencrypt_at(2);
        let err = creds
            .change_password(ChangePasswordRequest {
                current_pw: "pw".to_string(),
                new_pw: "new".to_string(),
                new_pw_confirm: "new".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ExtensionError::Migration(_)));
        assert_eq!(env.stores.password.data(), before);

        creds.lock();
        assert!(creds.authenticate("pw").await);
        let hashed = env.stores.password.get_password().unwrap();
        for account in env.keyring.accounts().await.unwrap() {
            env.keyring.unlock_check(&account.address, &hashed).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_reset_wallet() {
        let env = testing::credentials().await;
        let creds = &env.credentials;
        creds.onboard(onboard_request("pw", "pw", None)).await.unwrap();

        assert!(creds.reset_wallet().await.unwrap());
        assert!(!env.stores.app.get_is_onboarded());
        assert!(env.keyring.accounts().await.unwrap().is_empty());
        assert!(env.stores.seed_phrase.cipher().is_none());
        assert!(env.stores.sites.sites().is_empty());
        assert_eq!(creds.auth_status(), LoggedIn::False);
        assert!(env
            .browser
            .tab_urls()
            .iter()
            .any(|url| url.ends_with("onboarding.html#/import?resetWallet=true")));

        // Wallet can be onboarded again
        creds.onboard(onboard_request("pw2", "pw2", None)).await.unwrap();
    }
}
