use std::time::Duration;

use crate::skills::SkillDescriptor;

const QC_FLAGS: &[&str] = &["--output", "--json", "--min-quality", "--threads", "--sample"];
const ALIGN_FLAGS: &[&str] = &["--reference", "--output", "--json", "--threads", "--preset"];
const BASECALL_FLAGS: &[&str] = &["--model", "--output", "--json", "--device", "--threads"];
const MONITOR_FLAGS: &[&str] = &["--json", "--interval"];

const OUTPUT_AND_JSON: &[&str] = &["--output", "--json"];
const JSON_ONLY: &[&str] = &["--json"];

const ALL_SKILLS: [SkillDescriptor; 4] = [
    SkillDescriptor {
        name: "qc",
        description: "read quality control summary",
        stage: "qc",
        executable: "assay-qc",
        value_flags: QC_FLAGS,
        switch_flags: &["--force"],
        output_flags: OUTPUT_AND_JSON,
        expected_fields: &["reads"],
        default_timeout: Duration::from_secs(2 * 60 * 60),
    },
    SkillDescriptor {
        name: "align",
        description: "align reads against a reference",
        stage: "alignment",
        executable: "assay-align",
        value_flags: ALIGN_FLAGS,
        switch_flags: &["--secondary"],
        output_flags: OUTPUT_AND_JSON,
        expected_fields: &["mapped_fraction"],
        default_timeout: Duration::from_secs(12 * 60 * 60),
    },
    SkillDescriptor {
        name: "basecall",
        description: "convert raw signal to reads",
        stage: "basecalling",
        executable: "assay-basecall",
        value_flags: BASECALL_FLAGS,
        switch_flags: &["--resume"],
        output_flags: OUTPUT_AND_JSON,
        expected_fields: &["reads"],
        default_timeout: Duration::from_secs(48 * 60 * 60),
    },
    SkillDescriptor {
        name: "monitor",
        description: "snapshot of a running acquisition",
        stage: "monitoring",
        executable: "assay-monitor",
        value_flags: MONITOR_FLAGS,
        switch_flags: &[],
        output_flags: JSON_ONLY,
        expected_fields: &[],
        default_timeout: Duration::from_secs(5 * 60),
    },
];

pub fn descriptors() -> &'static [SkillDescriptor] {
    &ALL_SKILLS
}

pub fn descriptor(name: &str) -> Option<&'static SkillDescriptor> {
    ALL_SKILLS.iter().find(|descriptor| descriptor.name == name)
}
