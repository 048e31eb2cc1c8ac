//! Resolving actor paths into references.
//!
//! The [`RemoteActorRefProvider`] consults the [`Deployer`] to decide whether an actor lives on this node or
//! on another one. Local actors are reached through the [`LocalDelivery`] collaborator; remote actors through
//! an association managed by [`Remoting`].
//!
//! Actors deployed on another node are created there under the `remote` mount, with a path naming the
//! deploying node. Creating `/user/blub` on `test://remote-sys@localhost:12346` from
//! `test://RemotingSpec@localhost:12345` yields the path
//! `test://remote-sys@localhost:12346/remote/test/RemotingSpec@localhost:12345/user/blub`.

use std::{fmt, iter, sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::debug;

use crate::{
    address::Address,
    deployer::{Deployer, Scope},
    error::{DeliveryError, PathParseError, RemoteError},
    path::{split_elements, ActorPath, REMOTE_MOUNT, USER_GUARDIAN},
    remoting::{InboundMessage, LocalDelivery, RemoteEnvelope, Remoting, ReplyTo},
};

/// A reference to an actor on this node or on another one.
///
/// References are cheap to clone and can be shared between any number of senders.
#[derive(Clone, Debug)]
pub enum ActorRef {
    /// An actor on this node.
    Local(LocalActorRef),
    /// An actor on another node.
    Remote(RemoteActorRef),
}

impl ActorRef {
    /// The path of the actor.
    pub fn path(&self) -> &ActorPath {
        match self {
            ActorRef::Local(actor_ref) => actor_ref.path(),
            ActorRef::Remote(actor_ref) => actor_ref.path(),
        }
    }

    /// Returns `true` if the actor lives on another node.
    pub fn is_remote(&self) -> bool {
        matches!(self, ActorRef::Remote(_))
    }

    /// Sends a fire-and-forget message.
    pub async fn tell(&self, payload: Bytes, sender: Option<ActorPath>) -> Result<(), RemoteError> {
        match self {
            ActorRef::Local(actor_ref) => actor_ref.tell(payload, sender),
            ActorRef::Remote(actor_ref) => actor_ref.tell(payload, sender).await,
        }
    }

    /// Sends a request and waits up to `timeout` for the reply.
    pub async fn ask(&self, payload: Bytes, timeout: Duration) -> Result<Bytes, RemoteError> {
        match self {
            ActorRef::Local(actor_ref) => actor_ref.ask(payload, timeout).await,
            ActorRef::Remote(actor_ref) => actor_ref.ask(payload, timeout).await,
        }
    }
}

/// A reference to an actor on this node.
#[derive(Clone)]
pub struct LocalActorRef {
    path: ActorPath,
    local: Arc<dyn LocalDelivery>,
}

impl LocalActorRef {
    /// The path of the actor.
    pub fn path(&self) -> &ActorPath {
        &self.path
    }

    /// Sends a fire-and-forget message.
    pub fn tell(&self, payload: Bytes, sender: Option<ActorPath>) -> Result<(), RemoteError> {
        self.local
            .deliver(&self.path, InboundMessage::Tell { payload, sender })?;
        Ok(())
    }

    /// Sends a request and waits up to `timeout` for the reply.
    pub async fn ask(&self, payload: Bytes, timeout: Duration) -> Result<Bytes, RemoteError> {
        let (tx, rx) = oneshot::channel();
        self.local.deliver(
            &self.path,
            InboundMessage::Ask {
                payload,
                reply_to: ReplyTo::local(tx),
            },
        )?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(_)) => Err(DeliveryError::Rejected(format!(
                "{} dropped the request without replying",
                self.path
            ))
            .into()),
            Err(_) => Err(RemoteError::Timeout {
                recipient: self.path.clone(),
                timeout,
            }),
        }
    }
}

impl fmt::Debug for LocalActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalActorRef")
            .field("path", &self.path)
            .finish()
    }
}

/// A reference to an actor on another node.
///
/// The reference stays usable while the association to the node is down; sends fail until it can be
/// re-established.
#[derive(Clone)]
pub struct RemoteActorRef {
    path: ActorPath,
    remoting: Remoting,
}

impl RemoteActorRef {
    /// The path of the actor.
    pub fn path(&self) -> &ActorPath {
        &self.path
    }

    /// Sends a fire-and-forget message.
    ///
    /// Succeeds once the message is queued on the association. There is no acknowledgement from the
    /// recipient.
    pub async fn tell(&self, payload: Bytes, sender: Option<ActorPath>) -> Result<(), RemoteError> {
        self.remoting
            .send_envelope(
                self.path.address(),
                RemoteEnvelope::Tell {
                    recipient: self.path.clone(),
                    sender,
                    payload,
                },
            )
            .await
    }

    /// Sends a request and waits up to `timeout` for the reply.
    ///
    /// Fails with [`RemoteError::Timeout`] if no reply arrives in time, and with
    /// [`RemoteError::Delivery`] if the remote node has no actor at the path.
    pub async fn ask(&self, payload: Bytes, timeout: Duration) -> Result<Bytes, RemoteError> {
        self.remoting.ask(&self.path, payload, timeout).await
    }
}

impl fmt::Debug for RemoteActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteActorRef")
            .field("path", &self.path)
            .finish()
    }
}

/// Resolves paths into [`ActorRef`]s and creates actors according to the deployment rules.
#[derive(Clone, Debug)]
pub struct RemoteActorRefProvider {
    remoting: Remoting,
    deployer: Deployer,
    root: ActorPath,
}

impl RemoteActorRefProvider {
    /// Creates a provider rooted at the default address of `remoting`.
    pub fn new(remoting: Remoting, deployer: Deployer) -> Self {
        let root = ActorPath::root(remoting.default_address().clone());
        RemoteActorRefProvider {
            remoting,
            deployer,
            root,
        }
    }

    /// The deployment rules.
    pub fn deployer(&self) -> &Deployer {
        &self.deployer
    }

    /// The remoting service.
    pub fn remoting(&self) -> &Remoting {
        &self.remoting
    }

    /// The root path of this node.
    pub fn root_path(&self) -> &ActorPath {
        &self.root
    }

    /// Resolves a path without creating anything.
    ///
    /// `path` is either a full path such as `test://sys@host:1/user/a`, or a path relative to the user
    /// guardian such as `/a` or `/user/a`. Relative paths are looked up in the deployer; when a remote rule
    /// applies, the reference points at the actor's location on the remote node.
    ///
    /// Remote references are only returned once an association to the node exists, so a failure to
    /// associate is returned here.
    pub async fn resolve(&self, path: &str) -> Result<ActorRef, RemoteError> {
        if path.starts_with('/') {
            let mut elements = split_elements(path)
                .ok_or_else(|| PathParseError::InvalidRelative(path.to_string()))?;
            if elements.first().map(String::as_str) == Some(USER_GUARDIAN) {
                elements.remove(0);
            }
            return self.resolve_user(elements).await;
        }
        self.resolve_path(path.parse()?).await
    }

    /// Resolves a full path.
    pub async fn resolve_path(&self, path: ActorPath) -> Result<ActorRef, RemoteError> {
        if self.remoting.is_local(path.address()) {
            return Ok(self.local_ref(path));
        }
        self.remoting.associate(path.address()).await?;
        Ok(self.remote_ref(path))
    }

    /// Creates an actor named `name` under the user guardian.
    pub async fn actor_of(&self, name: &str) -> Result<ActorRef, RemoteError> {
        let guardian = ActorPath::user_guardian(self.root.address().clone());
        self.actor_of_under(&guardian, name).await
    }

    /// Creates an actor named `name` under the local actor `parent`.
    ///
    /// If a remote rule applies to the new path, the actor is created on the remote node under supervision
    /// of `parent` and a remote reference is returned. Otherwise it is created through
    /// [`LocalDelivery::create_child`].
    pub async fn actor_of_under(
        &self,
        parent: &ActorPath,
        name: &str,
    ) -> Result<ActorRef, RemoteError> {
        if !self.remoting.is_local(parent.address()) {
            return Err(RemoteError::NonLocalParent(parent.clone()));
        }
        let child = parent.child(name)?;
        let scope = child
            .elements_after(&[USER_GUARDIAN])
            .and_then(|elements| self.deployer.lookup(elements))
            .map(|deploy| deploy.scope().clone());

        match scope {
            Some(Scope::Remote(address)) if !self.remoting.is_local(&address) => {
                let elements = child.elements_after(&[USER_GUARDIAN]).unwrap_or_default();
                let path = self.remote_child_path(&address, elements)?;
                debug!(path = %path, supervisor = %parent, "deploying actor on remote node");
                self.remoting
                    .send_envelope(
                        &address,
                        RemoteEnvelope::CreateChild {
                            path: path.clone(),
                            supervisor: parent.clone(),
                        },
                    )
                    .await?;
                Ok(self.remote_ref(path))
            }
            _ => {
                self.remoting.local().create_child(&child, parent)?;
                Ok(self.local_ref(child))
            }
        }
    }

    async fn resolve_user(&self, elements: Vec<String>) -> Result<ActorRef, RemoteError> {
        match self.deployer.lookup(&elements).map(|deploy| deploy.scope().clone()) {
            Some(Scope::Remote(address)) if !self.remoting.is_local(&address) => {
                let path = self.remote_child_path(&address, &elements)?;
                self.remoting.associate(&address).await?;
                Ok(self.remote_ref(path))
            }
            _ => {
                let path = ActorPath::from_elements(
                    self.root.address().clone(),
                    iter::once(USER_GUARDIAN.to_string()).chain(elements),
                )?;
                Ok(self.local_ref(path))
            }
        }
    }

    /// The path on `target` of an actor deployed there from this node.
    fn remote_child_path(
        &self,
        target: &Address,
        elements: &[String],
    ) -> Result<ActorPath, RemoteError> {
        let local = self
            .remoting
            .local_address_for(target)
            .ok_or_else(|| RemoteError::UnsupportedScheme(target.protocol().to_string()))?;
        let mount = [
            REMOTE_MOUNT.to_string(),
            local.protocol().to_string(),
            local.authority(),
            USER_GUARDIAN.to_string(),
        ];
        Ok(ActorPath::from_elements(
            target.clone(),
            mount.into_iter().chain(elements.iter().cloned()),
        )?)
    }

    fn local_ref(&self, path: ActorPath) -> ActorRef {
        ActorRef::Local(LocalActorRef {
            path,
            local: self.remoting.local().clone(),
        })
    }

    fn remote_ref(&self, path: ActorPath) -> ActorRef {
        ActorRef::Remote(RemoteActorRef {
            path,
            remoting: self.remoting.clone(),
        })
    }
}
