//! Resource quantity arithmetic.
//!
//! Kubernetes quantities are strings ("500m", "512Mi"); all scheduler math
//! happens on integer milli-units so that capacity comparisons are exact.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use thiserror::Error;

pub const CPU: &str = "cpu";
pub const MEMORY: &str = "memory";
pub const EPHEMERAL_STORAGE: &str = "ephemeral-storage";
pub const PODS: &str = "pods";

#[derive(Debug, PartialEq, Error)]
pub enum QuantityError {
    #[error("unparseable quantity {0:?}")]
    Unparseable(String),
}

/// Parse a quantity into milli-units ("500m" → 500, "2" → 2000, "1Ki" →
/// 1_024_000). Integer math throughout; fractional digits beyond milli
/// precision are truncated.
pub fn parse_quantity(q: &Quantity) -> Result<i128, QuantityError> {
    let s = q.0.trim();
    if s.is_empty() {
        return Err(QuantityError::Unparseable(q.0.clone()));
    }
    let (number, suffix) = match s.find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-')) {
        Some(idx) => s.split_at(idx),
        None => (s, ""),
    };
    let multiplier: i128 = match suffix {
        "" => 1000,
        "m" => 1,
        "k" => 1000 * 1_000,
        "M" => 1000 * 1_000_000,
        "G" => 1000 * 1_000_000_000,
        "T" => 1000 * 1_000_000_000_000,
        "Ki" => 1000 * 1024,
        "Mi" => 1000 * 1024 * 1024,
        "Gi" => 1000 * 1024 * 1024 * 1024,
        "Ti" => 1000 * 1024 * 1024 * 1024 * 1024,
        _ => return Err(QuantityError::Unparseable(q.0.clone())),
    };
    let negative = number.starts_with('-');
    let digits = number.strip_prefix('-').unwrap_or(number);
    let (int_part, frac_part) = match digits.split_once('.') {
        Some((i, f)) => (i, f),
        None => (digits, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return Err(QuantityError::Unparseable(q.0.clone()));
    }
    if !int_part.chars().all(|c| c.is_ascii_digit())
        || !frac_part.chars().all(|c| c.is_ascii_digit())
    {
        return Err(QuantityError::Unparseable(q.0.clone()));
    }
    let whole: i128 = if int_part.is_empty() {
        0
    } else {
        int_part
            .parse()
            .map_err(|_| QuantityError::Unparseable(q.0.clone()))?
    };
    let mut value = whole * multiplier;
    if !frac_part.is_empty() {
        let mut scale = multiplier;
        for c in frac_part.chars() {
            scale /= 10;
            if scale == 0 {
                break;
            }
            value += (c as i128 - '0' as i128) * scale;
        }
    }
    Ok(if negative { -value } else { value })
}

/// Format milli-units back into a quantity string. Whole units are emitted
/// plain; anything fractional keeps the milli suffix.
pub fn format_millis(v: i128) -> Quantity {
    if v % 1000 == 0 {
        Quantity((v / 1000).to_string())
    } else {
        Quantity(format!("{v}m"))
    }
}

/// A resource vector in milli-units, keyed by resource name. Extended
/// resources (GPUs and friends) ride along untyped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources(BTreeMap<String, i128>);

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_list(list: &BTreeMap<String, Quantity>) -> Result<Self, QuantityError> {
        let mut out = BTreeMap::new();
        for (name, q) in list {
            out.insert(name.clone(), parse_quantity(q)?);
        }
        Ok(Self(out))
    }

    pub fn get(&self, name: &str) -> i128 {
        self.0.get(name).copied().unwrap_or(0)
    }

    pub fn set(&mut self, name: &str, millis: i128) {
        self.0.insert(name.to_string(), millis);
    }

    pub fn cpu_millis(&self) -> i128 {
        self.get(CPU)
    }

    pub fn memory_millis(&self) -> i128 {
        self.get(MEMORY)
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|v| *v == 0)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn add(&mut self, other: &Resources) {
        for (name, v) in &other.0 {
            *self.0.entry(name.clone()).or_insert(0) += v;
        }
    }

    /// Subtract, clamping at zero. Removal is idempotent for callers that
    /// track additions separately.
    pub fn sub_saturating(&mut self, other: &Resources) {
        for (name, v) in &other.0 {
            let entry = self.0.entry(name.clone()).or_insert(0);
            *entry = (*entry - v).max(0);
        }
    }

    /// Component-wise maximum, in place.
    pub fn merge_max(&mut self, other: &Resources) {
        for (name, v) in &other.0 {
            let entry = self.0.entry(name.clone()).or_insert(0);
            *entry = (*entry).max(*v);
        }
    }

    /// True when every resource this vector requests is available in
    /// `available`. Resources absent from `available` count as zero, so a
    /// GPU request never fits a GPU-less node.
    pub fn fits(&self, available: &Resources) -> bool {
        self.0.iter().all(|(name, v)| *v <= available.get(name))
    }

    /// Ordering key for First-Fit-Decreasing: cpu first, memory as the tie
    /// break.
    pub fn ffd_key(&self) -> (i128, i128) {
        (self.cpu_millis(), self.memory_millis())
    }

    pub fn to_list(&self) -> BTreeMap<String, Quantity> {
        self.0
            .iter()
            .map(|(name, v)| (name.clone(), format_millis(*v)))
            .collect()
    }
}

fn container_requests(container: &Container) -> Result<Resources, QuantityError> {
    match container.resources.as_ref().and_then(|r| r.requests.as_ref()) {
        Some(requests) => Resources::from_list(requests),
        None => Ok(Resources::new()),
    }
}

fn is_restartable_sidecar(container: &Container) -> bool {
    container.restart_policy.as_deref() == Some("Always")
}

/// Effective resource request of a pod, per the sidecar-aware rule:
/// the running-phase sum (regular containers plus restartable sidecars) or,
/// if larger, the peak of any init container stacked on the sidecars started
/// before it. Pod overhead is added on top.
pub fn pod_requests(pod: &Pod) -> Result<Resources, QuantityError> {
    let Some(spec) = pod.spec.as_ref() else {
        return Ok(Resources::new());
    };

    let mut running = Resources::new();
    for c in &spec.containers {
        running.add(&container_requests(c)?);
    }

    let mut peak = Resources::new();
    let mut sidecars_so_far = Resources::new();
    for c in spec.init_containers.as_deref().unwrap_or_default() {
        let req = container_requests(c)?;
        if is_restartable_sidecar(c) {
            sidecars_so_far.add(&req);
            running.add(&req);
        } else {
            let mut at_this_init = req;
            at_this_init.add(&sidecars_so_far);
            peak.merge_max(&at_this_init);
        }
    }

    let mut out = running;
    out.merge_max(&peak);
    if let Some(overhead) = &spec.overhead {
        out.add(&Resources::from_list(overhead)?);
    }
    // Every pod occupies one slot against the node's pod capacity.
    out.set(PODS, out.get(PODS) + 1000);
    Ok(out)
}

/// Pod limits, summed the simple way (limits have no scheduling role beyond
/// bookkeeping).
pub fn pod_limits(pod: &Pod) -> Result<Resources, QuantityError> {
    let Some(spec) = pod.spec.as_ref() else {
        return Ok(Resources::new());
    };
    let mut out = Resources::new();
    for c in spec
        .containers
        .iter()
        .chain(spec.init_containers.as_deref().unwrap_or_default())
    {
        if let Some(limits) = c.resources.as_ref().and_then(|r| r.limits.as_ref()) {
            out.add(&Resources::from_list(limits)?);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodSpec, ResourceRequirements};

    fn q(s: &str) -> Quantity {
        Quantity(s.to_string())
    }

    #[test]
    fn parses_plain_and_milli() {
        assert_eq!(parse_quantity(&q("2")), Ok(2000));
        assert_eq!(parse_quantity(&q("500m")), Ok(500));
        assert_eq!(parse_quantity(&q("1.5")), Ok(1500));
        assert_eq!(parse_quantity(&q("0.1")), Ok(100));
    }

    #[test]
    fn parses_binary_and_decimal_suffixes() {
        assert_eq!(parse_quantity(&q("1Ki")), Ok(1024 * 1000));
        assert_eq!(parse_quantity(&q("512Mi")), Ok(512 * 1024 * 1024 * 1000));
        assert_eq!(parse_quantity(&q("1G")), Ok(1_000_000_000_000));
        assert_eq!(parse_quantity(&q("2Ti")), Ok(2 * 1024_i128.pow(4) * 1000));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_quantity(&q("")).is_err());
        assert!(parse_quantity(&q("five")).is_err());
        assert!(parse_quantity(&q("1Qx")).is_err());
    }

    #[test]
    fn format_round_trips_whole_units() {
        assert_eq!(format_millis(2000).0, "2");
        assert_eq!(format_millis(1500).0, "1500m");
        assert_eq!(
            parse_quantity(&format_millis(512 * 1024 * 1024 * 1000)),
            Ok(512 * 1024 * 1024 * 1000)
        );
    }

    #[test]
    fn fits_treats_missing_resources_as_zero() {
        let mut gpu = Resources::new();
        gpu.set("nvidia.com/gpu", 1000);
        let mut node = Resources::new();
        node.set(CPU, 4000);
        assert!(!gpu.fits(&node));
        node.set("nvidia.com/gpu", 1000);
        assert!(gpu.fits(&node));
    }

    #[test]
    fn sub_saturates_at_zero() {
        let mut a = Resources::new();
        a.set(CPU, 1000);
        let mut b = Resources::new();
        b.set(CPU, 2500);
        a.sub_saturating(&b);
        assert_eq!(a.cpu_millis(), 0);
    }

    fn container(name: &str, cpu: &str, memory: &str, restart: Option<&str>) -> Container {
        Container {
            name: name.into(),
            restart_policy: restart.map(String::from),
            resources: Some(ResourceRequirements {
                requests: Some(BTreeMap::from([
                    (CPU.to_string(), q(cpu)),
                    (MEMORY.to_string(), q(memory)),
                ])),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn pod_request_takes_init_peak() {
        let pod = Pod {
            spec: Some(PodSpec {
                containers: vec![container("app", "500m", "512Mi", None)],
                init_containers: Some(vec![container("init", "2", "256Mi", None)]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let req = pod_requests(&pod).unwrap();
        // Init peak (2 cpu) dominates the running sum (500m).
        assert_eq!(req.cpu_millis(), 2000);
        assert_eq!(req.memory_millis(), 512 * 1024 * 1024 * 1000);
        assert_eq!(req.get(PODS), 1000);
    }

    #[test]
    fn restartable_sidecars_stack_under_later_inits() {
        let pod = Pod {
            spec: Some(PodSpec {
                containers: vec![container("app", "1", "128Mi", None)],
                init_containers: Some(vec![
                    container("proxy", "500m", "64Mi", Some("Always")),
                    container("migrate", "2", "128Mi", None),
                ]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let req = pod_requests(&pod).unwrap();
        // Sidecar runs alongside both the init peak (0.5 + 2) and the app
        // (0.5 + 1); the init phase wins on cpu.
        assert_eq!(req.cpu_millis(), 2500);
    }

    #[test]
    fn overhead_is_added() {
        let pod = Pod {
            spec: Some(PodSpec {
                containers: vec![container("app", "1", "128Mi", None)],
                overhead: Some(BTreeMap::from([(CPU.to_string(), q("100m"))])),
                ..Default::default()
            }),
            ..Default::default()
        };
        assert_eq!(pod_requests(&pod).unwrap().cpu_millis(), 1100);
    }
}
