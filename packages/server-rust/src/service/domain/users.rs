//! The `users` service: registration, login, token resolution and CRUD.
//!
//! Entities are exposed as `{ user: { id, username, email, bio, image } }`
//! (plus `token` on create/login); the password hash never leaves the
//! store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conduit_core::{CallContext, FieldRule, FieldViolation, ParamSchema, ValidationResult};
use serde_json::{json, Map, Value};
use tracing::{error, info};

use crate::service::action::{Action, ActionHandler, CachePolicy};
use crate::service::auth::AuthGate;
use crate::service::error::ActionError;
use crate::service::events::{EventBus, EventListener};
use crate::service::hooks::{ErrorOutcome, HookSet};
use crate::service::registry::{ManagedService, ServiceContext, ServiceDefinition};
use crate::traits::{EntityStore, PasswordHasher, UniqueViolation};

pub const SERVICE_NAME: &str = "users";

/// Fields copied from a stored record into the public entity.
const PUBLIC_FIELDS: [&str; 5] = ["id", "username", "email", "bio", "image"];

/// Unique entity fields, checked in this order, with their duplicate messages.
pub const UNIQUE_FIELDS: [(&str, &str); 2] =
    [("username", "Username is exist!"), ("email", "Email is exist!")];

const RESOLVE_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

// ---------------------------------------------------------------------------
// Schemas
// ---------------------------------------------------------------------------

fn entity_schema() -> ParamSchema {
    ParamSchema::new()
        .required("username", FieldRule::String { min: Some(2) })
        .required("password", FieldRule::String { min: Some(6) })
        .required("email", FieldRule::Email)
        .optional("bio", FieldRule::String { min: None })
        .optional("image", FieldRule::String { min: None })
}

fn id_schema() -> ParamSchema {
    ParamSchema::new().required("id", FieldRule::String { min: Some(1) })
}

fn user_object(props: Option<ParamSchema>) -> ParamSchema {
    ParamSchema::new().required("user", FieldRule::Object { props })
}

// ---------------------------------------------------------------------------
// UsersService
// ---------------------------------------------------------------------------

struct UsersInner {
    store: Arc<dyn EntityStore>,
    hasher: Arc<dyn PasswordHasher>,
    auth: Arc<AuthGate>,
    events: Arc<dyn EventBus>,
    token_lifetime: Duration,
}

/// User accounts backed by an [`EntityStore`].
pub struct UsersService {
    inner: Arc<UsersInner>,
}

impl UsersService {
    #[must_use]
    pub fn new(
        ctx: &ServiceContext,
        store: Arc<dyn EntityStore>,
        hasher: Arc<dyn PasswordHasher>,
    ) -> Self {
        Self {
            inner: Arc::new(UsersInner {
                store,
                hasher,
                auth: Arc::clone(&ctx.auth),
                events: Arc::clone(&ctx.events),
                token_lifetime: ctx.config.token_lifetime(),
            }),
        }
    }

    fn action(&self, name: &str, op: UsersOp) -> Action {
        Action::new(
            name,
            UsersAction {
                inner: Arc::clone(&self.inner),
                op,
            },
        )
    }
}

#[async_trait]
impl ManagedService for UsersService {
    fn name(&self) -> &'static str {
        SERVICE_NAME
    }

    fn definition(&self) -> ServiceDefinition {
        let login_props = ParamSchema::new()
            .required("email", FieldRule::Email)
            .required("password", FieldRule::String { min: Some(1) });
        let update_props = ParamSchema::new()
            .optional("username", FieldRule::String { min: Some(2) })
            .optional("password", FieldRule::String { min: Some(6) })
            .optional("email", FieldRule::Email)
            .optional("bio", FieldRule::String { min: None })
            .optional("image", FieldRule::String { min: None });

        let wildcard = HookSet::new().on_error(|ctx: &CallContext, err: ActionError| {
            error!(error = %err, "Error occurred when '{}' action was called", ctx.action);
            ErrorOutcome::Propagated(err)
        });

        let announce: Arc<dyn EventListener> = Arc::new(|_: &str, payload: &Value| {
            let id = payload.get("id").and_then(Value::as_str).unwrap_or_default();
            info!(user = id, "new user created");
        });

        // A cached resolution is served only while the token still verifies.
        let auth = Arc::clone(&self.inner.auth);
        let token_still_valid = move |params: &Value| {
            params["token"]
                .as_str()
                .is_some_and(|token| auth.authenticate(Some(token)).is_ok())
        };

        ServiceDefinition::new(SERVICE_NAME)
            .action(self.action("create", UsersOp::Create).params(user_object(None)))
            .action(
                self.action("login", UsersOp::Login)
                    .params(user_object(Some(login_props))),
            )
            .action(
                self.action("resolveToken", UsersOp::ResolveToken)
                    .params(ParamSchema::new().required("token", FieldRule::String { min: None }))
                    .cache(
                        CachePolicy::new(["token"], RESOLVE_TOKEN_TTL).guarded_by(token_still_valid),
                    ),
            )
            .action(self.action("list", UsersOp::List).auth_required())
            .action(
                self.action("get", UsersOp::Get)
                    .params(id_schema())
                    .auth_required(),
            )
            .action(
                self.action("update", UsersOp::Update)
                    .params(
                        id_schema().required("user", FieldRule::Object { props: Some(update_props) }),
                    )
                    .auth_required(),
            )
            .action(
                self.action("remove", UsersOp::Remove)
                    .params(id_schema())
                    .auth_required(),
            )
            .hooks(wildcard)
            .invalidate_on("users.create", SERVICE_NAME)
            .invalidate_on("users.update", SERVICE_NAME)
            .invalidate_on("users.remove", SERVICE_NAME)
            .invalidate_on("cache.clean.users", SERVICE_NAME)
            .invalidate_on("cache.clean.follows", SERVICE_NAME)
            .listen("users.create", announce)
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum UsersOp {
    Create,
    Login,
    ResolveToken,
    List,
    Get,
    Update,
    Remove,
}

struct UsersAction {
    inner: Arc<UsersInner>,
    op: UsersOp,
}

#[async_trait]
impl ActionHandler for UsersAction {
    async fn handle(&self, ctx: &CallContext) -> Result<Value, ActionError> {
        let users = &*self.inner;
        match self.op {
            UsersOp::Create => users.create(ctx).await,
            UsersOp::Login => users.login(ctx).await,
            UsersOp::ResolveToken => users.resolve_token(ctx).await,
            UsersOp::List => users.list().await,
            UsersOp::Get => users.get(ctx).await,
            UsersOp::Update => users.update(ctx).await,
            UsersOp::Remove => users.remove(ctx).await,
        }
    }
}

fn str_param<'a>(value: &'a Value, field: &str) -> Result<&'a str, ActionError> {
    value.get(field).and_then(Value::as_str).ok_or_else(|| {
        ActionError::validation(vec![FieldViolation::new(field, "must be a string")])
    })
}

/// Converts a store's [`UniqueViolation`] into `DuplicateEntity`; other
/// store failures become `Internal`.
fn duplicate_from_store(err: anyhow::Error) -> ActionError {
    let Some(violation) = err.downcast_ref::<UniqueViolation>() else {
        return err.into();
    };
    let message = UNIQUE_FIELDS
        .iter()
        .find(|(field, _)| *field == violation.field)
        .map_or("Entity is exist!", |(_, message)| *message);
    ActionError::duplicate_entity(message, &violation.field)
}

/// Copies the public fields of a stored record. `image` defaults to `""`.
fn public_user(record: &Value) -> Value {
    let mut user = Map::new();
    for field in PUBLIC_FIELDS {
        if let Some(value) = record.get(field) {
            user.insert(field.to_string(), value.clone());
        }
    }
    if user.get("image").filter(|v| !v.is_null()).is_none() {
        user.insert("image".to_string(), Value::String(String::new()));
    }
    Value::Object(user)
}

impl UsersInner {
    /// `{ user }`, with a token when asked: the caller's own if it sent
    /// one, otherwise a freshly issued one.
    fn entity_response(
        &self,
        record: &Value,
        with_token: bool,
        ctx: &CallContext,
    ) -> Result<Value, ActionError> {
        let mut user = public_user(record);
        if with_token {
            let token = match &ctx.token {
                Some(token) => token.clone(),
                None => self.auth.issue(
                    record["id"].as_str().unwrap_or_default(),
                    record["username"].as_str().unwrap_or_default(),
                    self.token_lifetime,
                )?,
            };
            user["token"] = Value::String(token);
        }
        Ok(json!({ "user": user }))
    }

    async fn find_by_id(&self, id: &str) -> Result<Value, ActionError> {
        self.store
            .find_one(&json!({ "id": id }))
            .await?
            .ok_or_else(|| ActionError::EntityNotFound { id: id.to_string() })
    }

    /// Rejects `username`/`email` values already taken by another record.
    /// Stores that enforce uniqueness themselves report a losing concurrent
    /// write through [`duplicate_from_store`].
    async fn ensure_unique(&self, entity: &Value, except_id: Option<&str>) -> Result<(), ActionError> {
        for (field, message) in UNIQUE_FIELDS {
            let Some(value) = entity.get(field).filter(|v| !v.is_null()) else {
                continue;
            };
            let found = self.store.find_one(&json!({ field: value })).await?;
            let taken = found.is_some_and(|rec| except_id != rec["id"].as_str());
            if taken {
                return Err(ActionError::duplicate_entity(message, field));
            }
        }
        Ok(())
    }

    async fn create(&self, ctx: &CallContext) -> Result<Value, ActionError> {
        let mut entity = ctx.params["user"].clone();
        if let ValidationResult::Invalid { violations } = entity_schema().validate(&entity) {
            return Err(ActionError::validation(violations));
        }
        self.ensure_unique(&entity, None).await?;

        let hashed = self.hasher.hash(str_param(&entity, "password")?);
        entity["password"] = Value::String(hashed);
        if entity.get("bio").filter(|v| !v.is_null()).is_none() {
            entity["bio"] = Value::String(String::new());
        }
        if entity.get("image").filter(|v| !v.is_null()).is_none() {
            entity["image"] = Value::String(String::new());
        }

        let doc = self.store.insert(entity).await.map_err(duplicate_from_store)?;
        self.events.emit("users.create", public_user(&doc)).await;
        self.entity_response(&doc, true, ctx)
    }

    async fn login(&self, ctx: &CallContext) -> Result<Value, ActionError> {
        let credentials = &ctx.params["user"];
        let email = str_param(credentials, "email")?;
        let password = str_param(credentials, "password")?;

        let not_found = |message: &str| ActionError::InvalidCredentials {
            message: message.to_string(),
            violations: vec![FieldViolation::new("email", "is not found")],
        };

        let user = self
            .store
            .find_one(&json!({ "email": email }))
            .await?
            .ok_or_else(|| not_found("Email or password is invalid!"))?;

        let hashed = user["password"].as_str().unwrap_or_default();
        if !self.hasher.verify(password, hashed) {
            return Err(not_found("Wrong password!"));
        }
        self.entity_response(&user, true, ctx)
    }

    async fn resolve_token(&self, ctx: &CallContext) -> Result<Value, ActionError> {
        let token = str_param(&ctx.params, "token")?;
        let identity = self.auth.authenticate(Some(token))?;
        let user = self.find_by_id(&identity.id).await?;
        Ok(public_user(&user))
    }

    async fn list(&self) -> Result<Value, ActionError> {
        let rows: Vec<Value> = self
            .store
            .find(&json!({}))
            .await?
            .iter()
            .map(public_user)
            .collect();
        Ok(json!({ "total": rows.len(), "rows": rows }))
    }

    async fn get(&self, ctx: &CallContext) -> Result<Value, ActionError> {
        let id = str_param(&ctx.params, "id")?;
        let user = self.find_by_id(id).await?;
        self.entity_response(&user, false, ctx)
    }

    async fn update(&self, ctx: &CallContext) -> Result<Value, ActionError> {
        let id = str_param(&ctx.params, "id")?;
        let mut patch = ctx.params["user"].clone();
        if let Some(fields) = patch.as_object_mut() {
            fields.retain(|field, _| PUBLIC_FIELDS.contains(&field.as_str()) || field == "password");
            fields.remove("id");
        }

        self.find_by_id(id).await?;
        self.ensure_unique(&patch, Some(id)).await?;
        if let Some(password) = patch.get("password").and_then(Value::as_str) {
            patch["password"] = Value::String(self.hasher.hash(password));
        }

        let doc = self
            .store
            .update(id, &patch)
            .await
            .map_err(duplicate_from_store)?
            .ok_or_else(|| ActionError::EntityNotFound { id: id.to_string() })?;
        self.events.emit("users.update", public_user(&doc)).await;
        self.entity_response(&doc, false, ctx)
    }

    async fn remove(&self, ctx: &CallContext) -> Result<Value, ActionError> {
        let id = str_param(&ctx.params, "id")?;
        let doc = self
            .store
            .remove(id)
            .await?
            .ok_or_else(|| ActionError::EntityNotFound { id: id.to_string() })?;
        self.events.emit("users.remove", public_user(&doc)).await;
        self.entity_response(&doc, false, ctx)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
