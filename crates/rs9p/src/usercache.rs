//! Pluggable uid/gid identity resolution.
//!
//! Every 9P attach carries a `uname` (and, for 9P2000.L, an `n_uname` uid); backends that
//! care about permission bits need to turn that into a uid/gid and, conversely, turn
//! stat uids/gids back into names. The reference server makes this a swappable vtable
//! (`Npuserpool`) with three stock implementations; this module keeps the same three
//! behaviors as implementations of a [`UserCache`] trait instead.

use std::collections::HashMap;

use async_trait::async_trait;
use nix::unistd::{Group, User};
use tokio::sync::RwLock;

use crate::error::Error;

/// No host identity is available for this uid: used by [`SimpleUserCache`], which
/// remembers names without ever resolving them against `/etc/passwd`.
pub const UNKNOWN_ID: u32 = u32::MAX;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserInfo {
    pub uid: u32,
    pub uname: String,
    pub gid: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupInfo {
    pub gid: u32,
    pub gname: String,
}

#[async_trait]
pub trait UserCache: Send + Sync {
    async fn uname2user(&self, uname: &str) -> Result<UserInfo, Error>;
    async fn uid2user(&self, uid: u32) -> Result<UserInfo, Error>;
    async fn gname2group(&self, gname: &str) -> Result<GroupInfo, Error>;
    async fn gid2group(&self, gid: u32) -> Result<GroupInfo, Error>;
    async fn is_member(&self, uid: u32, gid: u32) -> Result<bool, Error>;
}

/// Remembers the names it's told about without consulting the host's user database.
/// Every fabricated uid/gid is [`UNKNOWN_ID`] and nobody is ever a member of anybody
/// else's group. Good enough for a backend that doesn't enforce Unix permissions.
#[derive(Default)]
pub struct SimpleUserCache {
    users: RwLock<HashMap<String, UserInfo>>,
    groups: RwLock<HashMap<String, GroupInfo>>,
}

impl SimpleUserCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserCache for SimpleUserCache {
    async fn uname2user(&self, uname: &str) -> Result<UserInfo, Error> {
        if let Some(u) = self.users.read().await.get(uname) {
            return Ok(u.clone());
        }
        let group = self.gname2group(uname).await?;
        let info = UserInfo {
            uid: UNKNOWN_ID,
            uname: uname.to_owned(),
            gid: group.gid,
        };
        self.users
            .write()
            .await
            .insert(uname.to_owned(), info.clone());
        Ok(info)
    }

    async fn uid2user(&self, _uid: u32) -> Result<UserInfo, Error> {
        Err(Error::No(crate::error::errno::ENOENT))
    }

    async fn gname2group(&self, gname: &str) -> Result<GroupInfo, Error> {
        if let Some(g) = self.groups.read().await.get(gname) {
            return Ok(g.clone());
        }
        let info = GroupInfo {
            gid: UNKNOWN_ID,
            gname: gname.to_owned(),
        };
        self.groups
            .write()
            .await
            .insert(gname.to_owned(), info.clone());
        Ok(info)
    }

    async fn gid2group(&self, _gid: u32) -> Result<GroupInfo, Error> {
        Err(Error::No(crate::error::errno::ENOENT))
    }

    async fn is_member(&self, _uid: u32, _gid: u32) -> Result<bool, Error> {
        Ok(false)
    }
}

/// Resolves against the host's `/etc/passwd` and `/etc/group` (or whatever NSS is
/// configured to use), caching lookups since `getpwnam_r`/`getgrnam_r` go through libc.
#[derive(Default)]
pub struct UnixUserCache {
    by_name: RwLock<HashMap<String, UserInfo>>,
    by_uid: RwLock<HashMap<u32, UserInfo>>,
    groups_by_name: RwLock<HashMap<String, GroupInfo>>,
    groups_by_gid: RwLock<HashMap<u32, GroupInfo>>,
}

impl UnixUserCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn user_from_passwd(user: User) -> UserInfo {
        UserInfo {
            uid: user.uid.as_raw(),
            uname: user.name,
            gid: user.gid.as_raw(),
        }
    }

    fn group_from_libc(group: Group) -> GroupInfo {
        GroupInfo {
            gid: group.gid.as_raw(),
            gname: group.name,
        }
    }
}

#[async_trait]
impl UserCache for UnixUserCache {
    async fn uname2user(&self, uname: &str) -> Result<UserInfo, Error> {
        if let Some(u) = self.by_name.read().await.get(uname) {
            return Ok(u.clone());
        }
        let name = uname.to_owned();
        let user = tokio::task::spawn_blocking(move || User::from_name(&name))
            .await
            .map_err(|_| Error::No(crate::error::errno::EIO))?
            .map_err(Error::from)?
            .ok_or(Error::No(crate::error::errno::ENOENT))?;
        let info = Self::user_from_passwd(user);
        self.by_name
            .write()
            .await
            .insert(uname.to_owned(), info.clone());
        self.by_uid.write().await.insert(info.uid, info.clone());
        Ok(info)
    }

    async fn uid2user(&self, uid: u32) -> Result<UserInfo, Error> {
        if let Some(u) = self.by_uid.read().await.get(&uid) {
            return Ok(u.clone());
        }
        let user = tokio::task::spawn_blocking(move || User::from_uid(nix::unistd::Uid::from_raw(uid)))
            .await
            .map_err(|_| Error::No(crate::error::errno::EIO))?
            .map_err(Error::from)?
            .ok_or(Error::No(crate::error::errno::ENOENT))?;
        let info = Self::user_from_passwd(user);
        self.by_uid.write().await.insert(uid, info.clone());
        self.by_name
            .write()
            .await
            .insert(info.uname.clone(), info.clone());
        Ok(info)
    }

    async fn gname2group(&self, gname: &str) -> Result<GroupInfo, Error> {
        if let Some(g) = self.groups_by_name.read().await.get(gname) {
            return Ok(g.clone());
        }
        let name = gname.to_owned();
        let group = tokio::task::spawn_blocking(move || Group::from_name(&name))
            .await
            .map_err(|_| Error::No(crate::error::errno::EIO))?
            .map_err(Error::from)?
            .ok_or(Error::No(crate::error::errno::ENOENT))?;
        let info = Self::group_from_libc(group);
        self.groups_by_name
            .write()
            .await
            .insert(gname.to_owned(), info.clone());
        self.groups_by_gid
            .write()
            .await
            .insert(info.gid, info.clone());
        Ok(info)
    }

    async fn gid2group(&self, gid: u32) -> Result<GroupInfo, Error> {
        if let Some(g) = self.groups_by_gid.read().await.get(&gid) {
            return Ok(g.clone());
        }
        let group = tokio::task::spawn_blocking(move || Group::from_gid(nix::unistd::Gid::from_raw(gid)))
            .await
            .map_err(|_| Error::No(crate::error::errno::EIO))?
            .map_err(Error::from)?
            .ok_or(Error::No(crate::error::errno::ENOENT))?;
        let info = Self::group_from_libc(group);
        self.groups_by_gid.write().await.insert(gid, info.clone());
        self.groups_by_name
            .write()
            .await
            .insert(info.gname.clone(), info.clone());
        Ok(info)
    }

    async fn is_member(&self, uid: u32, gid: u32) -> Result<bool, Error> {
        let user = self.uid2user(uid).await?;
        if user.gid == gid {
            return Ok(true);
        }
        let group = self.gid2group(gid).await?;
        let name = group.gname.clone();
        tokio::task::spawn_blocking(move || {
            Group::from_name(&name)
                .ok()
                .flatten()
                .map(|g| g.mem.iter().any(|m| m == &user.uname))
                .unwrap_or(false)
        })
        .await
        .map_err(|_| Error::No(crate::error::errno::EIO))
    }
}

/// An admin-managed table: every uid/gid must be registered with [`PrivateUserCache::add_user`]
/// / [`PrivateUserCache::add_group`] before it resolves. Used by servers that authenticate
/// out-of-band (an auth fid exchange, a side channel) and don't want the host's
/// `/etc/passwd` consulted at all.
#[derive(Default)]
pub struct PrivateUserCache {
    users_by_name: RwLock<HashMap<String, UserInfo>>,
    users_by_uid: RwLock<HashMap<u32, UserInfo>>,
    groups_by_name: RwLock<HashMap<String, GroupInfo>>,
    groups_by_gid: RwLock<HashMap<u32, GroupInfo>>,
    memberships: RwLock<HashMap<u32, Vec<u32>>>,
}

impl PrivateUserCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_user(&self, info: UserInfo) -> Result<(), Error> {
        if self.users_by_uid.read().await.contains_key(&info.uid) {
            return Err(Error::No(crate::error::errno::EEXIST));
        }
        self.users_by_name
            .write()
            .await
            .insert(info.uname.clone(), info.clone());
        self.users_by_uid.write().await.insert(info.uid, info);
        Ok(())
    }

    pub async fn add_group(&self, info: GroupInfo) -> Result<(), Error> {
        if self.groups_by_gid.read().await.contains_key(&info.gid) {
            return Err(Error::No(crate::error::errno::EEXIST));
        }
        self.groups_by_name
            .write()
            .await
            .insert(info.gname.clone(), info.clone());
        self.groups_by_gid.write().await.insert(info.gid, info);
        Ok(())
    }

    pub async fn add_membership(&self, uid: u32, gid: u32) {
        self.memberships.write().await.entry(uid).or_default().push(gid);
    }
}

#[async_trait]
impl UserCache for PrivateUserCache {
    async fn uname2user(&self, uname: &str) -> Result<UserInfo, Error> {
        self.users_by_name
            .read()
            .await
            .get(uname)
            .cloned()
            .ok_or(Error::No(crate::error::errno::ENOENT))
    }

    async fn uid2user(&self, uid: u32) -> Result<UserInfo, Error> {
        self.users_by_uid
            .read()
            .await
            .get(&uid)
            .cloned()
            .ok_or(Error::No(crate::error::errno::ENOENT))
    }

    async fn gname2group(&self, gname: &str) -> Result<GroupInfo, Error> {
        self.groups_by_name
            .read()
            .await
            .get(gname)
            .cloned()
            .ok_or(Error::No(crate::error::errno::ENOENT))
    }

    async fn gid2group(&self, gid: u32) -> Result<GroupInfo, Error> {
        self.groups_by_gid
            .read()
            .await
            .get(&gid)
            .cloned()
            .ok_or(Error::No(crate::error::errno::ENOENT))
    }

    async fn is_member(&self, uid: u32, gid: u32) -> Result<bool, Error> {
        Ok(self
            .memberships
            .read()
            .await
            .get(&uid)
            .map(|gids| gids.contains(&gid))
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn simple_cache_fabricates_unknown_ids() {
        let cache = SimpleUserCache::new();
        let user = cache.uname2user("alice").await.unwrap();
        assert_eq!(user.uid, UNKNOWN_ID);
        assert_eq!(user.uname, "alice");
        assert!(!cache.is_member(user.uid, 0).await.unwrap());
    }

    #[tokio::test]
    async fn simple_cache_is_idempotent_per_name() {
        let cache = SimpleUserCache::new();
        let first = cache.uname2user("bob").await.unwrap();
        let second = cache.uname2user("bob").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn private_cache_requires_registration() {
        let cache = PrivateUserCache::new();
        assert!(cache.uname2user("nobody").await.is_err());

        cache
            .add_user(UserInfo {
                uid: 1000,
                uname: "nobody".to_owned(),
                gid: 1000,
            })
            .await
            .unwrap();
        let user = cache.uname2user("nobody").await.unwrap();
        assert_eq!(user.uid, 1000);
        assert_eq!(cache.uid2user(1000).await.unwrap(), user);
    }

    #[tokio::test]
    async fn private_cache_tracks_extra_group_membership() {
        let cache = PrivateUserCache::new();
        cache
            .add_user(UserInfo {
                uid: 1,
                uname: "u".to_owned(),
                gid: 1,
            })
            .await
            .unwrap();
        assert!(!cache.is_member(1, 42).await.unwrap());
        cache.add_membership(1, 42).await;
        assert!(cache.is_member(1, 42).await.unwrap());
    }
}
