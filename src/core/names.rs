//! Name sets read from the user's `config.json`
//!
//! The document is small and edited by hand (or by a settings UI) while the
//! governor runs. [`ConfigurationStore`] keeps the last parsed copy in an
//! [`ArcSwap`] and re-reads the file only when its modification time moves
//! forward, so every loop can call [`ConfigurationStore::load`] on each
//! iteration without locking. A reader may see the previous snapshot for one
//! iteration; it never sees a half-updated one.

use arc_swap::ArcSwap;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, warn};

use super::signal::AmbientMode;

/// Background apps closed when a game starts. The document's
/// `procesos_a_terminar` entries are added on top.
pub const DEFAULT_KILL_LIST: &[&str] = &[
    "dropbox.exe", "evernote.exe", "grammarly.exe", "todoist.exe", "onedriveupdater.exe",
    "discord.exe", "chrome.exe", "firefox.exe", "googleupdate.exe", "adobeupdater.exe",
    "javaupdater.exe", "spotify.exe", "vlc.exe", "lghub.exe", "razersynapse.exe",
    "nvcontainer.exe", "acrobat.exe", "adobearm.exe", "creativecloud.exe", "jusched.exe",
    "zoom.exe", "telegram.exe", "igfxtray.exe", "igfxpers.exe", "adobecollabsync.exe",
    "ccxprocess.exe", "googledrivesync.exe", "slack.exe", "teams.exe", "skype.exe",
    "galaxyclient.exe", "battle.net.exe", "eadesktop.exe", "icue.exe", "steelseriesgg.exe",
    "sharex.exe", "lightshot.exe", "ditto.exe", "powertoys.runner.exe", "qbittorrent.exe",
    "utorrent.exe", "ituneshelper.exe", "teamviewer.exe", "anydesk.exe", "megasync.exe",
    "signal.exe", "overwolf.exe", "medal.tv.exe", "armourycrate.exe", "dellsupportassist.exe",
    "lenovovantage.exe", "rainmeter.exe", "greenshot.exe", "everything.exe", "notion.exe",
    "whatsapp.exe", "viber.exe", "obsidian.exe", "1password.exe", "bitwarden.exe",
    "idman.exe", "ccleaner64.exe", "code.exe", "hwinfo64.exe", "autohotkey.exe",
    "wemod.exe", "curseforge.exe", "newsandinterests.exe", "onedrive.exe",
    "phoneexperiencehost.exe", "phonelink.exe", "msedge.exe", "adobeipcbroker.exe",
    "lcore.exe", "razercentral.exe", "officeclicktorun.exe", "nvbackend.exe",
    "amdrsserv.exe", "igfxem.exe", "auraservice.exe",
];

/// Services stopped when a game starts. The document's
/// `servicios_a_detener` entries are added on top.
pub const DEFAULT_STOP_LIST: &[&str] = &[
    "spooler", "wmpnetworksvc", "icssvc", "wsearch", "winrm", "remoteregistry",
    "seclogon", "sensordataservice", "sensormonitoringservice", "sensorservice",
    "lanmanserver", "sharedpcaccountmanager", "shellhwdetection", "scardsvr",
    "scdeviceenum", "scpolicysvc", "lmhosts", "tapisrv", "vds", "vss",
    "walletservice", "stisvc", "wisvc", "axinstsv", "bdesvc", "bthserv", "certpropsvc",
    "diagtrack", "dusmsvc", "dosvc", "dps", "wdiservicehost", "wdisystemhost", "diagsvc",
    "entappsvc", "fax", "lfsvc", "installservice", "onesyncsvc", "phonesvc", "pcasvc",
    "retaildemo", "tabletinputservice", "wuauserv", "wersvc", "mapsbroker",
];

#[derive(Debug, Default, Deserialize)]
struct NamesDocument {
    #[serde(default)]
    lista_blanca: Vec<String>,
    #[serde(default)]
    juegos: Vec<String>,
    #[serde(default)]
    ignorar: Vec<String>,
    #[serde(default)]
    procesos_a_terminar: Vec<String>,
    #[serde(default)]
    servicios_a_detener: Vec<String>,
    #[serde(default)]
    switches: Switches,
}

#[derive(Debug, Default, Deserialize)]
struct Switches {
    #[serde(default)]
    modo_normal: bool,
    #[serde(default)]
    modo_agresivo: bool,
}

/// Lowercased name sets. Replaced whole on reload, never edited in place.
#[derive(Debug, Clone, PartialEq)]
pub struct NameSets {
    /// Never re-prioritized, killed or trimmed
    pub protected: HashSet<String>,
    /// Executables that start game mode
    pub game_triggers: HashSet<String>,
    /// Never closed for inactivity
    pub inactivity_immune: HashSet<String>,
    /// Killed on game-mode activation, in list order
    pub kill_on_game_mode: Vec<String>,
    /// Stopped on game-mode activation, in list order
    pub stop_on_game_mode: Vec<String>,
    /// Ambient mode the user had switched on
    pub enabled_ambient_mode: Option<AmbientMode>,
}

impl Default for NameSets {
    fn default() -> Self {
        Self::from_document(NamesDocument::default())
    }
}

impl NameSets {
    fn from_document(doc: NamesDocument) -> Self {
        fn lower_set(items: Vec<String>) -> HashSet<String> {
            items.into_iter().map(|s| s.trim().to_lowercase()).collect()
        }

        fn extend_unique(defaults: &[&str], extra: Vec<String>) -> Vec<String> {
            let mut seen = HashSet::new();
            defaults
                .iter()
                .map(|s| s.to_string())
                .chain(extra.into_iter().map(|s| s.trim().to_lowercase()))
                .filter(|s| !s.is_empty() && seen.insert(s.clone()))
                .collect()
        }

        let enabled_ambient_mode = if doc.switches.modo_normal {
            Some(AmbientMode::Normal)
        } else if doc.switches.modo_agresivo {
            Some(AmbientMode::Aggressive)
        } else {
            None
        };

        Self {
            protected: lower_set(doc.lista_blanca),
            game_triggers: lower_set(doc.juegos),
            inactivity_immune: lower_set(doc.ignorar),
            kill_on_game_mode: extend_unique(DEFAULT_KILL_LIST, doc.procesos_a_terminar),
            stop_on_game_mode: extend_unique(DEFAULT_STOP_LIST, doc.servicios_a_detener),
            enabled_ambient_mode,
        }
    }

    /// Parse a JSON document.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        let doc: NamesDocument = serde_json::from_str(text)?;
        Ok(Self::from_document(doc))
    }

    pub fn is_protected(&self, name: &str) -> bool {
        self.protected.contains(&name.to_lowercase())
    }
}

struct Cached {
    names: Arc<NameSets>,
    modified: Option<SystemTime>,
}

/// mtime-keyed cache of the name-set document.
pub struct ConfigurationStore {
    path: PathBuf,
    cache: ArcSwap<Cached>,
}

impl ConfigurationStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let store = Self {
            path: path.into(),
            cache: ArcSwap::from_pointee(Cached {
                names: Arc::new(NameSets::default()),
                modified: None,
            }),
        };
        store.load();
        store
    }

    /// Store over a fixed value, never touching the filesystem.
    pub fn fixed(names: NameSets) -> Self {
        Self {
            path: PathBuf::new(),
            cache: ArcSwap::from_pointee(Cached {
                names: Arc::new(names),
                modified: Some(SystemTime::UNIX_EPOCH),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current name sets, re-reading the file if it changed.
    ///
    /// A missing file yields the defaults. A file that fails to read or parse
    /// keeps the previous snapshot.
    pub fn load(&self) -> Arc<NameSets> {
        let current = self.cache.load();
        if self.path.as_os_str().is_empty() {
            return current.names.clone();
        }

        let modified = match std::fs::metadata(&self.path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if current.modified.is_none() {
                    return current.names.clone();
                }
                debug!("{} removed, falling back to default name sets", self.path.display());
                let names = Arc::new(NameSets::default());
                self.cache.store(Arc::new(Cached {
                    names: names.clone(),
                    modified: None,
                }));
                return names;
            }
            Err(_) => return current.names.clone(),
        };

        if current.modified.is_some_and(|seen| modified <= seen) {
            return current.names.clone();
        }

        match std::fs::read_to_string(&self.path)
            .map_err(|e| e.to_string())
            .and_then(|text| NameSets::from_json(&text).map_err(|e| e.to_string()))
        {
            Ok(names) => {
                debug!(
                    "Reloaded {}: {} protected, {} triggers, {} immune",
                    self.path.display(),
                    names.protected.len(),
                    names.game_triggers.len(),
                    names.inactivity_immune.len()
                );
                let names = Arc::new(names);
                self.cache.store(Arc::new(Cached {
                    names: names.clone(),
                    modified: Some(modified),
                }));
                names
            }
            Err(e) => {
                warn!("Keeping previous name sets, {} is unreadable: {}", self.path.display(), e);
                self.cache.store(Arc::new(Cached {
                    names: current.names.clone(),
                    modified: Some(modified),
                }));
                current.names.clone()
            }
        }
    }
}
