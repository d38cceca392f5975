//! Concurrent writers and readers against one database.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use chrono::NaiveDate;

use enrolldb_core::{
    Database, DatabaseConfig, EnrollmentStore, Error, NewCourse, NewEnrollment, NewInstitution,
    NewPerson, NewTenant, RetryPolicy,
};

fn open() -> Database {
    Database::open(DatabaseConfig::temporary().with_retry(RetryPolicy::default().max_attempts(50)))
        .unwrap()
}

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 9, 1).unwrap()
}

#[test]
fn test_racing_duplicate_enrollments_admit_one() {
    let db = open();
    let tenant = db.create_tenant(NewTenant::new("acme")).unwrap();
    let institution = db
        .create_institution(NewInstitution::new(tenant.id, "North"))
        .unwrap();
    let courses: Vec<_> = (0..8)
        .map(|i| {
            db.create_course(NewCourse::new(
                tenant.id,
                institution.id,
                format!("Course {}", i),
            ))
            .unwrap()
        })
        .collect();
    let ada = db.create_person(NewPerson::new("Ada")).unwrap();

    let created = AtomicUsize::new(0);
    let rejected = AtomicUsize::new(0);
    thread::scope(|s| {
        for course in &courses {
            let (db, created, rejected) = (&db, &created, &rejected);
            s.spawn(move || {
                let result = db.create_enrollment(NewEnrollment::new(
                    tenant.id,
                    Some(institution.id),
                    ada.id,
                    course.id,
                    date(),
                ));
                match result {
                    Ok(_) => created.fetch_add(1, Ordering::SeqCst),
                    Err(Error::DuplicateActiveEnrollment { .. }) => {
                        rejected.fetch_add(1, Ordering::SeqCst)
                    }
                    Err(e) => panic!("unexpected error: {e}"),
                };
            });
        }
    });

    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(rejected.load(Ordering::SeqCst), courses.len() - 1);
    let counts = db
        .count_enrollments_by_course(tenant.id, institution.id, "")
        .unwrap();
    assert_eq!(counts.values().sum::<u64>(), 1);
}

#[test]
fn test_tenants_write_in_parallel() {
    let db = open();
    let tenants: Vec<_> = (0..4)
        .map(|i| {
            let tenant = db.create_tenant(NewTenant::new(format!("tenant {}", i))).unwrap();
            let institution = db
                .create_institution(NewInstitution::new(tenant.id, "Campus"))
                .unwrap();
            let course = db
                .create_course(NewCourse::new(tenant.id, institution.id, "Algebra"))
                .unwrap();
            (tenant, institution, course)
        })
        .collect();
    let persons: Vec<_> = (0..10)
        .map(|i| db.create_person(NewPerson::new(format!("Person {:02}", i))).unwrap())
        .collect();

    thread::scope(|s| {
        for (tenant, institution, course) in &tenants {
            let (db, persons) = (&db, &persons);
            s.spawn(move || {
                for person in persons {
                    db.create_enrollment(NewEnrollment::new(
                        tenant.id,
                        Some(institution.id),
                        person.id,
                        course.id,
                        date(),
                    ))
                    .unwrap();
                }
            });
        }
    });

    for (tenant, institution, course) in &tenants {
        let roster = db
            .list_roster(tenant.id, institution.id, course.id, 100, 0)
            .unwrap();
        assert_eq!(roster.len(), persons.len());
        assert!(roster.windows(2).all(|w| w[0].person_name <= w[1].person_name));
    }
}

#[test]
fn test_parent_delete_racing_inserts_leaves_no_orphans() {
    let db = open();
    let tenant = db.create_tenant(NewTenant::new("acme")).unwrap();
    let institution = db
        .create_institution(NewInstitution::new(tenant.id, "North"))
        .unwrap();
    let doomed = db
        .create_course(NewCourse::new(tenant.id, institution.id, "Doomed"))
        .unwrap();
    let persons: Vec<_> = (0..20)
        .map(|i| db.create_person(NewPerson::new(format!("Person {:02}", i))).unwrap())
        .collect();

    thread::scope(|s| {
        let db = &db;
        s.spawn(move || {
            for person in &persons {
                let result = db.create_enrollment(NewEnrollment::new(
                    tenant.id,
                    Some(institution.id),
                    person.id,
                    doomed.id,
                    date(),
                ));
                match result {
                    Ok(_) | Err(Error::DanglingReference { .. }) => {}
                    Err(e) => panic!("unexpected error: {e}"),
                }
            }
        });
        s.spawn(move || {
            thread::yield_now();
            db.delete_course(doomed.id).unwrap();
        });
    });

    assert!(matches!(
        db.get_course(doomed.id),
        Err(Error::NotFound { .. })
    ));
    let counts = db
        .count_enrollments_by_course(tenant.id, institution.id, "")
        .unwrap();
    assert!(!counts.contains_key(&doomed.id));
}

#[test]
fn test_readers_see_whole_cascades() {
    let db = open();
    let tenant = db.create_tenant(NewTenant::new("acme")).unwrap();
    let institution = db
        .create_institution(NewInstitution::new(tenant.id, "North"))
        .unwrap();
    let course = db
        .create_course(NewCourse::new(tenant.id, institution.id, "Algebra"))
        .unwrap();
    let persons: Vec<_> = (0..30)
        .map(|i| db.create_person(NewPerson::new(format!("Person {:02}", i))).unwrap())
        .collect();
    for person in &persons {
        db.create_enrollment(NewEnrollment::new(
            tenant.id,
            Some(institution.id),
            person.id,
            course.id,
            date(),
        ))
        .unwrap();
    }

    thread::scope(|s| {
        let db = &db;
        s.spawn(move || {
            for _ in 0..50 {
                let total: u64 = db
                    .count_enrollments_by_course(tenant.id, institution.id, "")
                    .unwrap()
                    .values()
                    .sum();
                // Either before or after the course delete, never halfway.
                assert!(total == 30 || total == 0, "saw {total} enrollments");
            }
        });
        s.spawn(move || {
            db.delete_course(course.id).unwrap();
        });
    });
}
