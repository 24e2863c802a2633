use rmpv::Value;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::bus::Bus;
use crate::property::{
    expect_bool, expect_string_list, string_list, validate_name, ManagerError, PropertyError, GROUP_GROUP,
    GROUP_NONE,
};

pub const PROP_GROUP_LIST: &str = "groupList";
pub const PROP_GROUP_NAME: &str = "groupName";
pub const PROP_APPLICATIONS: &str = "applications";
pub const PROP_LAUNCH_AT_START: &str = "launchAtStart";

/// A named set of applications started and stopped together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupSettings {
    #[serde(rename = "groupName")]
    pub name: String,
    pub applications: Vec<String>,
    pub launch_at_start: bool,
}

impl GroupSettings {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }
}

/// Groups only hold application names. Starting or stopping a group hands
/// the member list back to the caller, which owns the applications.
pub struct GroupManager {
    groups: Vec<GroupSettings>,
    bus: Bus,
}

impl GroupManager {
    pub fn new(bus: Bus) -> Self {
        Self {
            groups: Vec::new(),
            bus,
        }
    }

    pub fn load(&mut self, groups: Vec<GroupSettings>) {
        for g in groups {
            if validate_name(&g.name).is_ok() && self.find(&g.name).is_none() {
                self.groups.push(g);
            }
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.groups.iter().map(|g| g.name.clone()).collect()
    }

    pub fn settings(&self) -> Vec<GroupSettings> {
        self.groups.clone()
    }

    fn find(&self, name: &str) -> Option<&GroupSettings> {
        self.groups.iter().find(|g| g.name == name)
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut GroupSettings> {
        self.groups.iter_mut().find(|g| g.name == name)
    }

    fn announce_list(&self) {
        self.bus.value(GROUP_GROUP, GROUP_NONE, PROP_GROUP_LIST, string_list(self.names()));
    }

    pub fn add(&mut self, name: &str) -> Result<(), ManagerError> {
        validate_name(name)?;
        if self.find(name).is_some() {
            return Err(ManagerError::AlreadyExists(name.to_string()));
        }
        self.groups.push(GroupSettings::named(name));
        info!("added group '{name}'");
        self.announce_list();
        Ok(())
    }

    pub fn delete(&mut self, name: &str) -> Result<(), ManagerError> {
        let before = self.groups.len();
        self.groups.retain(|g| g.name != name);
        if self.groups.len() == before {
            return Err(ManagerError::NotFound(name.to_string()));
        }
        info!("deleted group '{name}'");
        self.announce_list();
        Ok(())
    }

    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), ManagerError> {
        validate_name(to)?;
        if self.find(to).is_some() {
            return Err(ManagerError::AlreadyExists(to.to_string()));
        }
        let group = self
            .find_mut(from)
            .ok_or_else(|| ManagerError::NotFound(from.to_string()))?;
        group.name = to.to_string();
        self.announce_list();
        Ok(())
    }

    /// Merges an imported entry by name, adding it if new.
    pub fn upsert(&mut self, settings: GroupSettings) -> Result<(), ManagerError> {
        validate_name(&settings.name)?;
        match self.find_mut(&settings.name) {
            Some(group) => {
                let mut changes = Vec::new();
                if group.applications != settings.applications {
                    group.applications = settings.applications.clone();
                    changes.push((PROP_APPLICATIONS, string_list(settings.applications.iter().cloned())));
                }
                if group.launch_at_start != settings.launch_at_start {
                    group.launch_at_start = settings.launch_at_start;
                    changes.push((PROP_LAUNCH_AT_START, Value::from(settings.launch_at_start)));
                }
                for (property, value) in changes {
                    self.bus.value(GROUP_GROUP, &settings.name, property, value);
                }
            }
            None => {
                self.groups.push(settings);
                self.announce_list();
            }
        }
        Ok(())
    }

    pub fn members(&self, name: &str) -> Result<Vec<String>, ManagerError> {
        self.find(name)
            .map(|g| g.applications.clone())
            .ok_or_else(|| ManagerError::NotFound(name.to_string()))
    }

    /// Member lists of every group marked `launchAtStart`, in group order.
    pub fn startup_members(&self) -> Vec<String> {
        self.groups
            .iter()
            .filter(|g| g.launch_at_start)
            .flat_map(|g| g.applications.iter().cloned())
            .collect()
    }

    // ── Properties ────────────────────────────────────────────────────────────

    pub fn get(&self, item: &str, property: &str) -> Result<Value, PropertyError> {
        if item.is_empty() {
            return match property {
                PROP_GROUP_LIST => Ok(string_list(self.names())),
                _ => Err(PropertyError::UnknownProperty(property.to_string())),
            };
        }
        let group = self
            .find(item)
            .ok_or_else(|| PropertyError::UnknownItem(item.to_string()))?;
        match property {
            PROP_GROUP_NAME => Ok(Value::from(group.name.as_str())),
            PROP_APPLICATIONS => Ok(string_list(group.applications.iter().cloned())),
            PROP_LAUNCH_AT_START => Ok(Value::from(group.launch_at_start)),
            _ => Err(PropertyError::UnknownProperty(property.to_string())),
        }
    }

    pub fn set(&mut self, item: &str, property: &str, value: &Value) -> Result<(), PropertyError> {
        let group = self
            .find_mut(item)
            .ok_or_else(|| PropertyError::UnknownItem(item.to_string()))?;
        let changed = match property {
            PROP_GROUP_NAME | PROP_GROUP_LIST => return Err(PropertyError::ReadOnly(property.to_string())),
            PROP_APPLICATIONS => {
                let apps = expect_string_list(property, value)?;
                let changed = group.applications != apps;
                group.applications = apps;
                changed
            }
            PROP_LAUNCH_AT_START => {
                let launch = expect_bool(property, value)?;
                let changed = group.launch_at_start != launch;
                group.launch_at_start = launch;
                changed
            }
            _ => return Err(PropertyError::UnknownProperty(property.to_string())),
        };
        if changed {
            self.bus.value(GROUP_GROUP, item, property, value.clone());
        }
        Ok(())
    }

    // ── Application cascades ──────────────────────────────────────────────────

    pub fn app_renamed(&mut self, from: &str, to: &str) {
        let mut changed = Vec::new();
        for group in &mut self.groups {
            let mut touched = false;
            for app in group.applications.iter_mut().filter(|a| a.as_str() == from) {
                *app = to.to_string();
                touched = true;
            }
            if touched {
                changed.push((group.name.clone(), group.applications.clone()));
            }
        }
        for (name, apps) in changed {
            self.bus.value(GROUP_GROUP, &name, PROP_APPLICATIONS, string_list(apps));
        }
    }

    pub fn app_deleted(&mut self, name: &str) {
        let mut changed = Vec::new();
        for group in &mut self.groups {
            let before = group.applications.len();
            group.applications.retain(|a| a != name);
            if group.applications.len() != before {
                changed.push((group.name.clone(), group.applications.clone()));
            }
        }
        for (group, apps) in changed {
            self.bus.value(GROUP_GROUP, &group, PROP_APPLICATIONS, string_list(apps));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{drain, Signal};

    fn manager() -> (GroupManager, tokio::sync::mpsc::UnboundedReceiver<Signal>) {
        let (bus, rx) = Bus::new();
        (GroupManager::new(bus), rx)
    }

    #[test]
    fn add_rename_delete() {
        let (mut m, _rx) = manager();
        m.add("lobby").unwrap();
        m.add("stage").unwrap();
        assert_eq!(m.add("lobby"), Err(ManagerError::AlreadyExists("lobby".to_string())));
        m.rename("lobby", "foyer").unwrap();
        assert_eq!(m.names(), vec!["foyer", "stage"]);
        m.delete("stage").unwrap();
        assert_eq!(m.delete("stage"), Err(ManagerError::NotFound("stage".to_string())));
        assert_eq!(m.get("", PROP_GROUP_LIST).unwrap(), string_list(["foyer"]));
    }

    #[test]
    fn set_type_checks_and_emits_on_change() {
        let (mut m, mut rx) = manager();
        m.add("lobby").unwrap();
        drain(&mut rx);

        let apps = string_list(["web", "db"]);
        m.set("lobby", PROP_APPLICATIONS, &apps).unwrap();
        m.set("lobby", PROP_APPLICATIONS, &apps).unwrap();
        assert_eq!(drain(&mut rx).len(), 1);

        assert!(matches!(
            m.set("lobby", PROP_LAUNCH_AT_START, &Value::from("yes")),
            Err(PropertyError::TypeMismatch { .. })
        ));
        assert_eq!(
            m.set("lobby", PROP_GROUP_NAME, &Value::from("x")),
            Err(PropertyError::ReadOnly(PROP_GROUP_NAME.to_string()))
        );
        assert_eq!(m.members("lobby").unwrap(), vec!["web", "db"]);
    }

    #[test]
    fn app_cascades_update_membership() {
        let (mut m, mut rx) = manager();
        m.load(vec![
            GroupSettings {
                name: "a".to_string(),
                applications: vec!["web".to_string(), "db".to_string()],
                launch_at_start: true,
            },
            GroupSettings {
                name: "b".to_string(),
                applications: vec!["db".to_string()],
                launch_at_start: false,
            },
        ]);
        m.app_renamed("web", "site");
        assert_eq!(m.members("a").unwrap(), vec!["site", "db"]);
        assert_eq!(drain(&mut rx).len(), 1);

        m.app_deleted("db");
        assert_eq!(m.members("a").unwrap(), vec!["site"]);
        assert!(m.members("b").unwrap().is_empty());
        assert_eq!(drain(&mut rx).len(), 2);
    }

    #[test]
    fn startup_members_come_from_launch_at_start_groups() {
        let (mut m, _rx) = manager();
        m.load(vec![
            GroupSettings {
                name: "a".to_string(),
                applications: vec!["web".to_string()],
                launch_at_start: true,
            },
            GroupSettings {
                name: "b".to_string(),
                applications: vec!["db".to_string()],
                launch_at_start: false,
            },
        ]);
        assert_eq!(m.startup_members(), vec!["web"]);
    }
}
