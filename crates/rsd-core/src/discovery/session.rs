use std::collections::{BTreeMap, HashMap, HashSet};

use serde::Serialize;
use tokio::time::Instant;

use crate::region::{Classification, Coordinates, RegionCode};
use crate::target::{Instance, Target};

/// Everything one orchestrator has learned about the current collection.
///
/// Reset wholesale at the start of a full refresh; a region-scoped refresh
/// only clears that region's list.
#[derive(Debug, Default)]
pub struct DiscoverySession {
    collection_id: Option<String>,
    all_instances: Vec<Instance>,
    index: HashMap<Target, usize>,
    classifications: HashMap<Target, Classification>,
    per_region: BTreeMap<RegionCode, Vec<Target>>,
    representatives: HashMap<RegionCode, Instance>,
    pub(crate) next_page_cursor: Option<String>,
    pub(crate) refresh_in_progress: bool,
    pub(crate) rate_limited: bool,
    pub(crate) next_page_earliest: Option<Instant>,
    pub(crate) client_location: Option<Coordinates>,
}

/// One instance with its classification, as handed to renderers.
#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedInstance {
    #[serde(flatten)]
    pub instance: Instance,
    pub region: Option<RegionCode>,
    pub coordinates: Option<Coordinates>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub collection_id: Option<String>,
    pub instances: Vec<ClassifiedInstance>,
    pub region_counts: BTreeMap<RegionCode, usize>,
    pub representatives: BTreeMap<RegionCode, String>,
    pub next_page_cursor: Option<String>,
    pub rate_limited: bool,
    pub refresh_in_progress: bool,
    pub client_location: Option<Coordinates>,
}

impl DiscoverySession {
    pub(crate) fn reset_all(&mut self, collection_id: &str) {
        self.collection_id = Some(collection_id.to_string());
        self.all_instances.clear();
        self.index.clear();
        self.classifications.clear();
        self.per_region.clear();
        self.representatives.clear();
        self.next_page_cursor = None;
    }

    pub(crate) fn reset_region(&mut self, region: &RegionCode) {
        self.per_region.remove(region);
    }

    /// Merge a page into `all_instances` keyed by target. Returns the page's
    /// instances with in-page duplicates removed, in listing order.
    pub(crate) fn merge_page(&mut self, collection_id: &str, page: Vec<Instance>) -> Vec<Instance> {
        let mut seen: HashSet<Target> = HashSet::with_capacity(page.len());
        let mut unique = Vec::with_capacity(page.len());
        for instance in page {
            let target = instance.target(collection_id);
            if !seen.insert(target.clone()) {
                continue;
            }
            if !self.index.contains_key(&target) {
                self.index.insert(target, self.all_instances.len());
                self.all_instances.push(instance.clone());
            }
            unique.push(instance);
        }
        unique
    }

    pub fn collection_id(&self) -> Option<&str> {
        self.collection_id.as_deref()
    }

    pub fn classification(&self, target: &Target) -> Option<&Classification> {
        self.classifications.get(target)
    }

    pub(crate) fn record(&mut self, target: Target, classification: Classification) {
        self.classifications.insert(target, classification);
    }

    /// First instance seen in a region stays its representative.
    pub(crate) fn note_representative(&mut self, region: &RegionCode, instance: &Instance) {
        self.representatives
            .entry(region.clone())
            .or_insert_with(|| instance.clone());
    }

    /// Append `target` to the region list unless it is already there.
    pub(crate) fn append_to_region(&mut self, region: &RegionCode, target: &Target) -> bool {
        let list = self.per_region.entry(region.clone()).or_default();
        if list.contains(target) {
            return false;
        }
        list.push(target.clone());
        true
    }

    /// Recompute every region list from `all_instances` order.
    pub(crate) fn rebuild_regions(&mut self) {
        let mut rebuilt: BTreeMap<RegionCode, Vec<Target>> = BTreeMap::new();
        for target in self.targets_in_listing_order() {
            if let Some(c) = self.classifications.get(&target) {
                if !c.region_code.is_unknown() {
                    rebuilt.entry(c.region_code.clone()).or_default().push(target);
                }
            }
        }
        self.per_region = rebuilt;
    }

    pub(crate) fn rebuild_region(&mut self, region: &RegionCode) {
        let list: Vec<Target> = self
            .targets_in_listing_order()
            .filter(|t| {
                self.classifications
                    .get(t)
                    .is_some_and(|c| &c.region_code == region)
            })
            .collect();
        if list.is_empty() {
            self.per_region.remove(region);
        } else {
            self.per_region.insert(region.clone(), list);
        }
    }

    fn targets_in_listing_order(&self) -> impl Iterator<Item = Target> + '_ {
        let collection = self.collection_id.as_deref().unwrap_or_default();
        self.all_instances.iter().map(move |i| i.target(collection))
    }

    pub fn all_instances(&self) -> &[Instance] {
        &self.all_instances
    }

    pub fn region_targets(&self, region: &RegionCode) -> &[Target] {
        self.per_region.get(region).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn instances_in(&self, region: &RegionCode) -> Vec<Instance> {
        self.region_targets(region)
            .iter()
            .filter_map(|t| self.index.get(t).map(|&i| self.all_instances[i].clone()))
            .collect()
    }

    pub fn region_counts(&self) -> BTreeMap<RegionCode, usize> {
        self.per_region
            .iter()
            .map(|(code, list)| (code.clone(), list.len()))
            .collect()
    }

    pub fn representative(&self, region: &RegionCode) -> Option<&Instance> {
        self.representatives.get(region)
    }

    pub fn rate_limited(&self) -> bool {
        self.rate_limited
    }

    pub fn client_location(&self) -> Option<Coordinates> {
        self.client_location
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let collection = self.collection_id.as_deref().unwrap_or_default();
        let instances = self
            .all_instances
            .iter()
            .map(|instance| {
                let c = self.classifications.get(&instance.target(collection));
                ClassifiedInstance {
                    instance: instance.clone(),
                    region: c.map(|c| c.region_code.clone()),
                    coordinates: c.and_then(|c| c.coordinates),
                }
            })
            .collect();
        SessionSnapshot {
            collection_id: self.collection_id.clone(),
            instances,
            region_counts: self.region_counts(),
            representatives: self
                .representatives
                .iter()
                .map(|(code, inst)| (code.clone(), inst.id.clone()))
                .collect(),
            next_page_cursor: self.next_page_cursor.clone(),
            rate_limited: self.rate_limited,
            refresh_in_progress: self.refresh_in_progress,
            client_location: self.client_location,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classified(code: &str) -> Classification {
        Classification {
            region_code: RegionCode::new(code),
            coordinates: None,
        }
    }

    #[test]
    fn merge_dedupes_across_and_within_pages() {
        let mut s = DiscoverySession::default();
        s.reset_all("1");
        let first = s.merge_page("1", vec![Instance::new("a"), Instance::new("b"), Instance::new("a")]);
        assert_eq!(first.len(), 2);
        let second = s.merge_page("1", vec![Instance::new("b"), Instance::new("c")]);
        assert_eq!(second.len(), 2);
        let ids: Vec<_> = s.all_instances().iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
    }

    #[test]
    fn region_append_is_idempotent() {
        let mut s = DiscoverySession::default();
        let region = RegionCode::new("US-CA");
        let t = Target::new("1", "a");
        assert!(s.append_to_region(&region, &t));
        assert!(!s.append_to_region(&region, &t));
        assert_eq!(s.region_targets(&region), [t]);
    }

    #[test]
    fn rebuild_follows_listing_order_and_skips_unknown() {
        let mut s = DiscoverySession::default();
        s.reset_all("1");
        s.merge_page("1", vec![Instance::new("a"), Instance::new("b"), Instance::new("c")]);
        let de = RegionCode::new("DE");
        s.record(Target::new("1", "c"), classified("DE"));
        s.record(Target::new("1", "a"), classified("DE"));
        s.record(Target::new("1", "b"), Classification::unknown());
        s.append_to_region(&de, &Target::new("1", "c"));
        s.append_to_region(&de, &Target::new("1", "a"));

        s.rebuild_regions();
        assert_eq!(s.region_targets(&de), [Target::new("1", "a"), Target::new("1", "c")]);
        assert_eq!(s.region_counts().len(), 1);

        s.reset_region(&de);
        assert!(s.region_targets(&de).is_empty());
        s.rebuild_region(&de);
        assert_eq!(s.instances_in(&de).len(), 2);
    }

    #[test]
    fn snapshot_reports_representatives_and_classifications() {
        let mut s = DiscoverySession::default();
        s.reset_all("1");
        s.merge_page("1", vec![Instance::new("a"), Instance::new("b")]);
        let de = RegionCode::new("DE");
        s.record(Target::new("1", "a"), classified("DE"));
        s.note_representative(&de, &Instance::new("a"));
        s.note_representative(&de, &Instance::new("b"));

        let snap = s.snapshot();
        assert_eq!(snap.instances.len(), 2);
        assert_eq!(snap.instances[0].region, Some(de.clone()));
        assert_eq!(snap.instances[1].region, None);
        assert_eq!(snap.representatives[&de], "a");
    }
}
