//! Locally owned PVs, registered from data rather than from types.
//!
//! [`LocalPvSpec`] is a plain description of one served PV (initial value,
//! array length, access, enum state strings, record type). A spec can be
//! written out by hand, or derived from a remote channel's metadata with
//! [`LocalPvSpec::from_descriptor`]. Consuming a spec produces a [`LocalPv`]
//! row: the shared value store with its update broadcast and monitor
//! triggers. [`LocalProvider`] serves a table of such rows directly;
//! mirrored PVs reuse the same row type but are served elsewhere.

use std::{
    collections::HashMap,
    future::Future,
    marker::PhantomData,
    sync::{Arc, Mutex},
    time::SystemTime,
};

use tokio::sync::{
    broadcast::{self},
    mpsc::{self, error::TrySendError},
};
use tracing::{debug, error};

use crate::{
    Provider,
    client::RemoteDescriptor,
    dbr::{
        DBR_CLASS_NAME, Dbr, DbrBasicType, DbrCategory, DbrControl, DbrGraphics, DbrType,
        DbrValue, MonitorMask, Status,
    },
    messages::{self, ErrorCondition},
    providers::WriteDisposition,
};

/// Translate an incoming CA value to a PV's native representation
///
/// String data is matched against the enum state strings (enum targets)
/// or parsed (numeric targets); everything else goes through the plain
/// value conversion. The local store and the upstream forwarding path
/// both use this, so they accept and reject exactly the same writes.
pub(crate) fn translate_value(
    value: &DbrValue,
    native_type: DbrBasicType,
    labels: Option<&[String]>,
) -> Result<DbrValue, ErrorCondition> {
    if value.get_type() == native_type {
        return Ok(value.clone());
    }
    if native_type == DbrBasicType::Enum {
        if let DbrValue::String(items) = value {
            let [text] = items.as_slice() else {
                return Err(ErrorCondition::BadCount);
            };
            if let Some(labels) = labels
                && let Some(code) = labels.iter().position(|l| l == text)
            {
                return Ok(DbrValue::Enum(code as u16));
            }
            // No matching state string; numeric state indices still work
            return value
                .parse_into(DbrBasicType::Enum)
                .map_err(|_| ErrorCondition::NoConvert);
        }
        return value.convert_to(DbrBasicType::Enum);
    }
    if value.get_type() == DbrBasicType::String {
        return value
            .parse_into(native_type)
            .map_err(|_| ErrorCondition::NoConvert);
    }
    value.convert_to(native_type)
}

/// Data-driven description of one locally served PV
#[derive(Clone, Debug)]
pub struct LocalPvSpec {
    /// The initial value, which also fixes the native type
    pub value: DbrValue,
    /// Served array length. If set, at least this many elements are sent
    /// to readers; longer stored values raise it. Meaningless for enums.
    pub max_length: Option<usize>,
    /// Reject client writes with NoWtAccess and advertise read-only rights
    pub read_only: bool,
    /// State strings, for enum-typed PVs
    pub enum_labels: Option<Vec<String>>,
    /// The EPICS record type, for CLASS_NAME responses. Defaults per value type.
    pub record_type: Option<String>,
}

impl LocalPvSpec {
    pub fn new(value: impl Into<DbrValue>) -> Self {
        let value = value.into();
        LocalPvSpec {
            max_length: match value {
                DbrValue::Enum(_) => None,
                _ => Some(value.get_count().max(1)),
            },
            read_only: false,
            enum_labels: None,
            record_type: None,
            value,
        }
    }

    /// Derive the spec of a local PV that stands in for a remote channel
    pub fn from_descriptor(descriptor: &RemoteDescriptor, force_read_only: bool) -> Self {
        let value = descriptor.initial_value.clone();
        LocalPvSpec {
            max_length: match value {
                DbrValue::Enum(_) => None,
                _ => Some(descriptor.element_count.max(1)),
            },
            read_only: force_read_only || !descriptor.write_access,
            enum_labels: descriptor.enum_labels.clone(),
            record_type: None,
            value,
        }
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn enum_labels<I>(mut self, labels: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.enum_labels = Some(labels.into_iter().map(|l| l.into()).collect());
        self
    }

    pub fn record_type(mut self, record_type: &str) -> Self {
        self.record_type = Some(record_type.to_owned());
        self
    }
}

/// One served PV: the shared value store and its notification plumbing
#[derive(Clone, Debug)]
pub(crate) struct LocalPv {
    pub(crate) name: String,
    value: Arc<Mutex<DbrValue>>,
    /// Minimum array length. If set, at least this many array items will
    /// be sent to subscribers, and if a longer value is assigned then this
    /// minimum length will be increased. If None, then only the current
    /// array length items will be sent.
    minimum_length: Option<usize>,
    /// The last time this value was written
    timestamp: SystemTime,
    /// Channel to send updates to any interested listeners
    sender: broadcast::Sender<Dbr>,
    /// Trigger channel, to notify the server there is a new broadcast available
    triggers: HashMap<u64, mpsc::Sender<String>>,
    /// The EPICS record type, for CLASS_NAME responses
    epics_record_type: Option<String>,
    /// State strings, for enum-typed PVs
    enum_labels: Option<Vec<String>>,
    /// Whether client writes are rejected
    pub(crate) read_only: bool,
}

impl LocalPv {
    pub(crate) fn from_spec(name: &str, spec: LocalPvSpec) -> LocalPv {
        LocalPv {
            name: name.to_owned(),
            value: Arc::new(Mutex::new(spec.value)),
            minimum_length: spec.max_length,
            timestamp: SystemTime::now(),
            sender: broadcast::Sender::new(16),
            triggers: Default::default(),
            epics_record_type: spec.record_type,
            enum_labels: spec.enum_labels,
            read_only: spec.read_only,
        }
    }

    pub(crate) fn load(&self) -> DbrValue {
        let value = self.value.lock().unwrap();
        value.clone()
    }

    fn label_for(&self, code: u16) -> String {
        self.enum_labels
            .as_ref()
            .and_then(|labels| labels.get(code as usize).cloned())
            .unwrap_or_else(|| code.to_string())
    }

    fn graphics_for(&self, value: &DbrValue) -> DbrGraphics {
        match (&self.enum_labels, value.get_type()) {
            (Some(labels), DbrBasicType::Enum) => DbrGraphics::Enum {
                labels: labels.clone(),
            },
            (_, kind) => DbrGraphics::default_for(kind),
        }
    }

    /// Load the value to a Dbr ready to send to a CA client
    ///
    /// This includes adjustments for minimum size, enum handling (a
    /// string read of an enum gives back the state label; Graphics and
    /// Control reads carry the state strings), and CLASS_NAME responses.
    pub(crate) fn load_for_ca(&self, requested_type: Option<DbrType>) -> Dbr {
        let mut value = self.value.lock().unwrap().clone();
        if requested_type == Some(DBR_CLASS_NAME) {
            return Dbr::ClassName(DbrValue::String(vec![
                self.epics_record_type
                    .clone()
                    .unwrap_or_else(|| value.get_default_record_type()),
            ]));
        }
        // Handle minimum length
        if let Some(size) = self.minimum_length
            && value.get_count() < size
        {
            let _ = value.resize(size);
        }
        // Enums read as strings give back the state label
        if let Some(requested) = requested_type
            && requested.basic_type == DbrBasicType::String
            && let DbrValue::Enum(code) = value
        {
            value = DbrValue::String(vec![self.label_for(code)]);
        }
        let status = Status::default();
        match requested_type.map(|t| t.category) {
            Some(DbrCategory::Graphics) => Dbr::Graphics {
                status,
                graphics: self.graphics_for(&value),
                value,
            },
            Some(DbrCategory::Control) => Dbr::Control {
                status,
                graphics: self.graphics_for(&value),
                control: DbrControl::default_for(value.get_type()),
                value,
            },
            _ => Dbr::Time {
                status,
                timestamp: self.timestamp,
                value,
            },
        }
    }

    /// Store a value from the CA protocol to the PV
    ///
    /// In this case, there are special behaviours like parsing numbers
    /// out of string data and mapping enum state strings to codes
    pub(crate) fn store_from_ca(&mut self, value: &DbrValue) -> Result<(), ErrorCondition> {
        let native_type = self.value.lock().unwrap().get_type();
        let value = translate_value(value, native_type, self.enum_labels.as_deref())?;
        self.store(&value)
    }

    pub(crate) fn store(&mut self, value: &DbrValue) -> Result<(), ErrorCondition> {
        self.store_at(value, SystemTime::now())
    }

    /// Store a value with an externally supplied timestamp
    ///
    /// Used when the value originates elsewhere and the source timestamp
    /// must be preserved for readers.
    pub(crate) fn store_at(
        &mut self,
        value: &DbrValue,
        timestamp: SystemTime,
    ) -> Result<(), ErrorCondition> {
        // Update the shared value
        {
            let stored_value = &mut *self.value.lock().unwrap();
            *stored_value = value.convert_to(stored_value.get_type())?;
            // Update the minimum length, if we are now longer
            if let Some(size) = self.minimum_length
                && stored_value.get_count() > size
            {
                self.minimum_length = Some(stored_value.get_count());
            }
            // Ensure lock is dropped
        }
        self.timestamp = timestamp;
        // Now send off the new value to any listeners
        let _ = self.sender.send(self.load_for_ca(None));
        // Send the "please look at" triggers, filtering out any that are dead
        self.triggers = self
            .triggers
            .iter()
            .filter_map(|(k, t)| match t.try_send(self.name.clone()) {
                Ok(_) => Some((*k, t.clone())),
                Err(TrySendError::Full(_)) => Some((*k, t.clone())),
                Err(TrySendError::Closed(_)) => None,
            })
            .collect();
        Ok(())
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<Dbr> {
        self.sender.subscribe()
    }

    pub(crate) fn monitor(
        &mut self,
        unique_subscriber_id: u64,
        trigger: mpsc::Sender<String>,
    ) -> broadcast::Receiver<Dbr> {
        self.triggers.insert(unique_subscriber_id, trigger);
        self.sender.subscribe()
    }

    pub(crate) fn unmonitor(&mut self, unique_subscriber_id: u64) {
        self.triggers.remove(&unique_subscriber_id);
    }
}

/// Typed interface to reading single values to/from a PV
#[derive(Clone, Debug)]
pub struct PvHandle<T> {
    pv: Arc<Mutex<LocalPv>>,
    _marker: PhantomData<T>,
}

impl<T> PvHandle<T>
where
    T: Clone + Default,
    DbrValue: From<Vec<T>>,
    for<'a> Vec<T>: TryFrom<&'a DbrValue, Error = ErrorCondition>,
{
    fn new(pv: Arc<Mutex<LocalPv>>) -> Self {
        if cfg!(debug_assertions) {
            // Ensure that this pv can be converted into our static type..
            // the library user should not be able to do this, so this
            // indicates an error in our logic
            let Ok(_) = Vec::<T>::try_from(&pv.lock().unwrap().load()) else {
                panic!("Failed to convert PV to static type");
            };
        }
        Self {
            pv,
            _marker: PhantomData,
        }
    }

    pub fn load(&self) -> T {
        let value = self.pv.lock().unwrap().load();
        let items: Vec<T> = match (&value).try_into() {
            Ok(v) => v,
            _ => panic!("Provider logic should ensure this conversion never fails!"),
        };
        items.into_iter().next().unwrap_or_default()
    }

    pub fn store(&self, value: T) {
        self.pv
            .lock()
            .unwrap()
            .store(&vec![value].into())
            .expect("Provider logic should ensure this never fails");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Dbr> {
        self.pv.lock().unwrap().subscribe()
    }
}

#[derive(Debug)]
pub struct PVAlreadyExists;

/// Serves a table of purely local PVs
#[derive(Clone, Default)]
pub struct LocalProvider {
    pvs: Arc<Mutex<HashMap<String, Arc<Mutex<LocalPv>>>>>,
    /// A Prefix that is inserted in front of any PV name
    pub prefix: String,
}

impl LocalProvider {
    pub fn new() -> LocalProvider {
        LocalProvider {
            pvs: Arc::new(Mutex::new(HashMap::new())),
            prefix: String::new(),
        }
    }

    fn register_pv(&mut self, pv: LocalPv) -> Result<Arc<Mutex<LocalPv>>, PVAlreadyExists> {
        let name = pv.name.clone();
        let mut pvmap = self.pvs.lock().unwrap();
        if pvmap.contains_key(&name) {
            return Err(PVAlreadyExists);
        }
        let pv = Arc::new(Mutex::new(pv));
        let _ = pvmap.insert(name, pv.clone());
        Ok(pv)
    }

    /// Register a PV described by a spec row
    pub fn add_spec(&mut self, name: &str, spec: LocalPvSpec) -> Result<(), PVAlreadyExists> {
        self.register_pv(LocalPv::from_spec(name, spec))?;
        Ok(())
    }

    /// Register a PV with a typed handle for in-process reads and writes
    pub fn add_pv<T>(&mut self, name: &str, initial_value: T) -> Result<PvHandle<T>, PVAlreadyExists>
    where
        T: Clone + Default,
        DbrValue: From<Vec<T>>,
        for<'a> Vec<T>: TryFrom<&'a DbrValue, Error = ErrorCondition>,
    {
        let pv = self.register_pv(LocalPv::from_spec(
            name,
            LocalPvSpec::new(DbrValue::from(vec![initial_value])),
        ))?;
        Ok(PvHandle::<T>::new(pv))
    }

    /// Watch updates to a PV from the Rust side
    pub fn subscribe(&self, name: &str) -> Option<broadcast::Receiver<Dbr>> {
        let pvmap = self.pvs.lock().unwrap();
        Some(pvmap.get(name)?.lock().unwrap().subscribe())
    }

    /// Normalize a PV name by stripping the serving prefix
    fn normalize_pv_name<'a>(&self, pv_name: &'a str) -> &'a str {
        pv_name.strip_prefix(&self.prefix).unwrap_or(pv_name)
    }

    fn get_pv(&self, pv_name: &str) -> Result<Arc<Mutex<LocalPv>>, ErrorCondition> {
        let pvmap = self.pvs.lock().unwrap();
        Ok(pvmap
            .get(self.normalize_pv_name(pv_name))
            .ok_or(ErrorCondition::UnavailInServ)?
            .clone())
    }
}

impl Provider for LocalProvider {
    fn provides(&self, pv_name: &str) -> bool {
        if !pv_name.starts_with(&self.prefix) {
            return false;
        }
        self.pvs
            .lock()
            .unwrap()
            .contains_key(self.normalize_pv_name(pv_name))
    }

    fn read_value(
        &self,
        pv_name: &str,
        requested_type: Option<DbrType>,
    ) -> Result<Dbr, ErrorCondition> {
        let pv = self.get_pv(pv_name)?;
        let pv = pv.lock().unwrap();
        Ok(pv.load_for_ca(requested_type))
    }

    fn get_access_right(
        &self,
        pv_name: &str,
        _client_user_name: Option<&str>,
        _client_host_name: Option<&str>,
    ) -> messages::Access {
        match self.get_pv(pv_name) {
            Ok(pv) if pv.lock().unwrap().read_only => messages::Access::Read,
            Ok(_) => messages::Access::ReadWrite,
            Err(_) => messages::Access::Deny,
        }
    }

    fn write_value(
        &mut self,
        pv_name: &str,
        value: Dbr,
    ) -> impl Future<Output = Result<WriteDisposition, ErrorCondition>> + Send {
        let result = (|| {
            let pv = self.get_pv(pv_name)?;
            let mut pv = pv.lock().unwrap();
            if pv.read_only {
                return Err(ErrorCondition::NoWtAccess);
            }
            debug!("Provider: Processing write: {value:?}");
            if let Err(e) = pv.store_from_ca(value.value()) {
                error!("    Error: {e:?}");
                return Err(e);
            }
            Ok(WriteDisposition::Committed)
        })();
        async move { result }
    }

    fn monitor_value(
        &mut self,
        pv_name: &str,
        unique_subscriber_id: u64,
        _data_type: DbrType,
        _data_count: usize,
        _mask: MonitorMask,
        trigger: mpsc::Sender<String>,
    ) -> Result<broadcast::Receiver<Dbr>, ErrorCondition> {
        let pv = self.get_pv(pv_name)?;
        let mut pv = pv.lock().unwrap();
        Ok(pv.monitor(unique_subscriber_id, trigger))
    }

    fn cancel_monitor_value(
        &mut self,
        pv_name: &str,
        unique_subscriber_id: u64,
        _data_type: DbrType,
        _data_count: usize,
    ) {
        let Ok(pv) = self.get_pv(pv_name) else {
            debug!("Got remove subscription for nonexistent subscription!");
            return;
        };
        pv.lock().unwrap().unmonitor(unique_subscriber_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dbr::DBR_BASIC_STRING;

    #[test]
    fn test_string_pv() {
        let mut provider = LocalProvider::new();
        let handle = provider.add_pv("TEST", "Test String".to_string()).unwrap();
        assert_eq!(handle.load(), "Test String");
        assert_eq!(
            provider
                .read_value("TEST", None)
                .unwrap()
                .data_type()
                .basic_type,
            DbrBasicType::String
        );
    }

    #[test]
    fn test_enum_row() {
        let spec = LocalPvSpec::new(DbrValue::Enum(0)).enum_labels(["OFF", "ON", "FAULT"]);
        let mut pv = LocalPv::from_spec("STATE", spec);
        // Control reads carry the state strings
        let dbr = pv.load_for_ca(Some(DbrType {
            basic_type: DbrBasicType::Enum,
            category: DbrCategory::Control,
        }));
        assert_eq!(
            dbr.graphics().and_then(|g| g.enum_labels()),
            Some(&["OFF".to_string(), "ON".to_string(), "FAULT".to_string()][..])
        );
        // String reads give the label back
        let dbr = pv.load_for_ca(Some(DBR_BASIC_STRING));
        assert_eq!(*dbr.value(), DbrValue::String(vec!["OFF".to_string()]));
        // Writing a label stores the matching code
        pv.store_from_ca(&"ON".into()).unwrap();
        assert_eq!(pv.load(), DbrValue::Enum(1));
        // Numeric state strings still work, unknown labels do not
        pv.store_from_ca(&"2".into()).unwrap();
        assert_eq!(pv.load(), DbrValue::Enum(2));
        assert!(pv.store_from_ca(&"MAYBE".into()).is_err());
    }

    #[test]
    fn test_store_at_keeps_timestamp() {
        let mut pv = LocalPv::from_spec("VAL", LocalPvSpec::new(0.0f64));
        let remote_time = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_100);
        pv.store_at(&DbrValue::Double(vec![2.71]), remote_time)
            .unwrap();
        let dbr = pv.load_for_ca(None);
        assert_eq!(dbr.timestamp(), Some(remote_time));
        assert_eq!(*dbr.value(), DbrValue::Double(vec![2.71]));
    }

    #[test]
    fn test_translate() {
        let labels = ["OFF".to_string(), "ON".to_string()];
        assert_eq!(
            translate_value(&"3.5".into(), DbrBasicType::Double, None).unwrap(),
            DbrValue::Double(vec![3.5])
        );
        assert_eq!(
            translate_value(&"ON".into(), DbrBasicType::Enum, Some(&labels)).unwrap(),
            DbrValue::Enum(1)
        );
        assert_eq!(
            translate_value(&DbrValue::Long(vec![1]), DbrBasicType::Enum, Some(&labels)).unwrap(),
            DbrValue::Enum(1)
        );
        assert!(translate_value(&"BROKEN".into(), DbrBasicType::Enum, Some(&labels)).is_err());
        assert_eq!(
            translate_value(&DbrValue::Double(vec![4.0]), DbrBasicType::Long, None).unwrap(),
            DbrValue::Long(vec![4])
        );
    }
}
